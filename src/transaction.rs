//! Transaction wrapper.
//!
//! ```ignore
//! let committed = conn
//!     .transaction(None, |tx| Box::pin(async move {
//!         tx.execute("INSERT INTO items VALUES ($1)", &[1i32.into()]).await?;
//!         Ok(TxDecision::Commit)
//!     }))
//!     .await?;
//! ```

use futures::future::BoxFuture;

use crate::connection::PgConnection;
use crate::error::{PgError, PgResult};
use crate::protocol::TransactionStatus;

/// Transaction isolation level for `BEGIN ISOLATION LEVEL ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// How a transaction body wants the transaction to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDecision {
    Commit,
    Rollback,
}

fn begin_sql(isolation: Option<IsolationLevel>) -> String {
    match isolation {
        Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
        None => "BEGIN".to_string(),
    }
}

/// Run `body` inside BEGIN ... COMMIT/ROLLBACK.
///
/// Returns `true` only when the server acknowledged COMMIT. A body error
/// rolls back and is returned as is; a failed rollback is logged, not raised.
pub async fn run_transaction<F>(conn: &mut PgConnection, isolation: Option<IsolationLevel>, body: F) -> PgResult<bool>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, PgResult<TxDecision>>,
{
    if conn.transaction_status() != TransactionStatus::Idle {
        return Err(PgError::NestedTransaction);
    }

    conn.simple_query(&begin_sql(isolation)).await?;

    match body(conn).await {
        Ok(TxDecision::Commit) => {
            let committed = conn.commit().await?;
            if !committed {
                conn.logger().info("COMMIT of a failed transaction was rolled back by the server");
            }
            Ok(committed)
        }
        Ok(TxDecision::Rollback) => {
            conn.rollback().await?;
            Ok(false)
        }
        Err(e) => {
            if conn.is_usable() {
                if let Err(rollback_err) = conn.rollback().await {
                    conn.logger()
                        .warning(&format!("Rollback after failed transaction body also failed: {}", rollback_err));
                }
            }
            Err(e)
        }
    }
}

impl PgConnection {
    /// See [`run_transaction`].
    pub async fn transaction<F>(&mut self, isolation: Option<IsolationLevel>, body: F) -> PgResult<bool>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, PgResult<TxDecision>>,
    {
        run_transaction(self, isolation, body).await
    }
}
