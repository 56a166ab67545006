//! LISTEN/NOTIFY.
//!
//! Any connection can listen, but a connection that holds subscriptions is
//! not returned to a pool. [`PgListener`] owns a dedicated connection for
//! long-lived subscriptions.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PgConfig;
use crate::connection::PgConnection;
use crate::error::PgResult;
use crate::logger::Logger;
use crate::registry::Registry;

/// An asynchronous notification delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Backend process that sent the notification.
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// A dedicated listening connection.
#[derive(Debug)]
pub struct PgListener {
    conn: PgConnection,
}

impl PgListener {
    pub async fn connect(url: &str) -> PgResult<Self> {
        Ok(Self::from_connection(PgConnection::connect(url).await?))
    }

    pub async fn connect_with(config: PgConfig, registry: Arc<Registry>, logger: Arc<dyn Logger>) -> PgResult<Self> {
        Ok(Self::from_connection(
            PgConnection::connect_with(config, registry, logger).await?,
        ))
    }

    pub fn from_connection(conn: PgConnection) -> Self {
        Self { conn }
    }

    pub async fn listen(&mut self, channel: &str) -> PgResult<()> {
        self.conn.listen(channel).await
    }

    pub async fn listen_all<'a>(&mut self, channels: impl IntoIterator<Item = &'a str>) -> PgResult<()> {
        for channel in channels {
            self.conn.listen(channel).await?;
        }
        Ok(())
    }

    pub async fn unlisten(&mut self, channel: &str) -> PgResult<()> {
        self.conn.unlisten(channel).await
    }

    /// Wait up to `timeout` for the next notification.
    pub async fn recv(&mut self, timeout: Duration) -> PgResult<Notification> {
        self.conn.wait_for_notification(timeout).await
    }

    /// Notifications already received, without waiting.
    pub fn try_recv_all(&mut self) -> Vec<Notification> {
        self.conn.take_notifications()
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        self.conn.is_listening(channel)
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub fn into_connection(self) -> PgConnection {
        self.conn
    }

    pub async fn close(mut self) -> PgResult<()> {
        self.conn.close().await
    }
}
