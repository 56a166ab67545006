//! pgdirect - a native PostgreSQL wire-protocol client.
//!
//! Speaks protocol 3.0 directly over TCP or TLS: startup and authentication
//! (cleartext, MD5, SCRAM-SHA-256), the simple and extended query protocols,
//! LISTEN/NOTIFY, and a bounded connection pool.
//!
//! ```ignore
//! let pool = PgPool::connect(PgPoolConfig::from_url("postgresql://app@localhost/app")?).await?;
//! let mut conn = pool.acquire().await?;
//! let rows = conn.execute("SELECT $1::int4 AS n", &[42i32.into()]).await?;
//! assert_eq!(rows.first().unwrap().get(0)?, PgValue::Int4(42));
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod logger;
pub mod notify;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod row;
pub mod statement;
pub mod tls;
pub mod transaction;
pub mod types;

mod scram;
mod stream;

#[cfg(test)]
mod mock;

pub use config::{PgConfig, SslMode};
pub use connection::{ConnectionState, PgConnection, Query};
pub use error::{PgError, PgResult, ServerError};
pub use logger::{Logger, NullLogger, TracingLogger};
pub use notify::{Notification, PgListener};
pub use pool::{AfterConnect, PgPool, PgPoolConfig, PoolStats, PooledConnection};
pub use protocol::{Format, TransactionStatus};
pub use registry::{default_registry, Registry, Transcoder};
pub use row::{QueryResult, Row, RowStream};
pub use statement::PreparedStatement;
pub use tls::{TlsConfig, TlsVerification};
pub use transaction::{IsolationLevel, TxDecision};
pub use types::{Oid, PgValue};
