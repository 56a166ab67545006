//! PostgreSQL connection.
//!
//! One `PgConnection` owns one socket and runs one exchange at a time; the
//! `&mut self` receivers make concurrent use a compile error.
//!
//! Every exchange moves the connection `Ready -> Executing -> Ready`. An I/O
//! or protocol failure leaves it `Broken`. A future dropped mid-exchange
//! leaves it `Executing`, and both states refuse further work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::config::PgConfig;
use crate::error::{PgError, PgResult, ServerError};
use crate::logger::{default_logger, Logger};
use crate::notify::Notification;
use crate::protocol::{
    check_param_limits, BackendMessage, BindMessage, CloseMessage, DescribeMessage, ExecuteMessage,
    FieldDescription, Format, FrontendMessage, ParseMessage, PasswordMessage, QueryMessage, RowValues,
    SaslInitialResponseMessage, SaslResponseMessage, StartupMessage, SyncMessage, TerminateMessage,
    TransactionStatus,
};
use crate::registry::{default_registry, Registry};
use crate::row::{QueryResult, Row, RowStream};
use crate::scram::{self, ScramClient};
use crate::statement::{PreparedStatement, SharedColumns, StatementCache};
use crate::stream::PgStream;
use crate::tls;
use crate::types::{Oid, PgValue};

const READ_BUFFER_CAPACITY: usize = 32 * 1024;
const WRITE_BUFFER_CAPACITY: usize = 8 * 1024;

/// SQLSTATE class for invalid authorization.
const AUTH_SQLSTATE_CLASS: &str = "28";
/// invalid_sql_statement_name
const UNKNOWN_STATEMENT_SQLSTATE: &str = "26000";

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    /// Idle between exchanges, with the last reported transaction status.
    Ready(TransactionStatus),
    /// An exchange is in flight.
    Executing,
    /// A row stream was abandoned; its remaining messages must be discarded.
    Draining,
    Closed,
    Broken,
}

/// What to execute: SQL text or a named prepared statement.
#[derive(Debug, Clone, Copy)]
pub enum Query<'q> {
    Sql(&'q str),
    Prepared(&'q str),
}

impl<'q> From<&'q str> for Query<'q> {
    fn from(sql: &'q str) -> Self {
        Query::Sql(sql)
    }
}

impl<'q> From<&'q String> for Query<'q> {
    fn from(sql: &'q String) -> Self {
        Query::Sql(sql)
    }
}

impl<'q> From<&'q PreparedStatement> for Query<'q> {
    fn from(stmt: &'q PreparedStatement) -> Self {
        Query::Prepared(&stmt.name)
    }
}

impl<'q> From<&'q Arc<PreparedStatement>> for Query<'q> {
    fn from(stmt: &'q Arc<PreparedStatement>) -> Self {
        Query::Prepared(&stmt.name)
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct PgConnection {
    reader: ReadHalf<PgStream>,
    writer: WriteHalf<PgStream>,
    /// Bytes received but not yet decoded; survives cancelled reads.
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    config: PgConfig,
    state: ConnectionState,
    transaction_status: TransactionStatus,
    statements: StatementCache,
    registry: Arc<Registry>,
    logger: Arc<dyn Logger>,
    /// Server parameters (server_version, client_encoding, ...)
    parameters: HashMap<String, String>,
    backend_pid: i32,
    backend_secret_key: i32,
    notifications: VecDeque<Notification>,
    /// Channels the session is subscribed to as of the last commit.
    listening: HashSet<String>,
    /// LISTEN/UNLISTEN issued in the open transaction block; applied on COMMIT.
    pending_listens: Vec<ListenChange>,
    /// Outcome of the last COMMIT/ROLLBACK seen in the current exchange.
    transaction_end: Option<bool>,
    tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenChange {
    Listen(String),
    Unlisten(String),
    UnlistenAll,
}

impl ListenChange {
    fn apply(self, listening: &mut HashSet<String>) {
        match self {
            ListenChange::Listen(channel) => {
                listening.insert(channel);
            }
            ListenChange::Unlisten(channel) => {
                listening.remove(&channel);
            }
            ListenChange::UnlistenAll => listening.clear(),
        }
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state)
            .field("backend_pid", &self.backend_pid)
            .field("tls", &self.tls)
            .finish()
    }
}

impl PgConnection {
    /// Connect using a URL, the built-in registry and the tracing logger.
    pub async fn connect(url: &str) -> PgResult<Self> {
        let config = PgConfig::from_url(url)?;
        Self::connect_with(config, default_registry(), default_logger()).await
    }

    pub async fn connect_with_config(config: PgConfig) -> PgResult<Self> {
        Self::connect_with(config, default_registry(), default_logger()).await
    }

    /// Connect with an explicit registry and logger.
    ///
    /// `connect_timeout` bounds TCP connect, TLS negotiation and
    /// authentication together.
    pub async fn connect_with(config: PgConfig, registry: Arc<Registry>, logger: Arc<dyn Logger>) -> PgResult<Self> {
        match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, Self::establish(config, registry, logger))
                .await
                .map_err(|_| PgError::Connection(format!("Timed out after {:?} while connecting", limit)))?,
            None => Self::establish(config, registry, logger).await,
        }
    }

    async fn establish(config: PgConfig, registry: Arc<Registry>, logger: Arc<dyn Logger>) -> PgResult<Self> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| PgError::Connection(format!("Failed to connect to {}:{}: {}", config.host, config.port, e)))?;
        tcp.set_nodelay(true)?;

        let stream = tls::negotiate(tcp, &config.host, config.ssl_mode, config.tls.as_ref(), logger.as_ref()).await?;
        let tls = stream.is_tls();
        let (reader, writer) = tokio::io::split(stream);

        let mut conn = Self {
            reader,
            writer,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            write_buffer: BytesMut::with_capacity(WRITE_BUFFER_CAPACITY),
            statements: StatementCache::new(config.statement_cache_capacity),
            config,
            state: ConnectionState::Connecting,
            transaction_status: TransactionStatus::Idle,
            registry,
            logger,
            parameters: HashMap::new(),
            backend_pid: 0,
            backend_secret_key: 0,
            notifications: VecDeque::new(),
            listening: HashSet::new(),
            pending_listens: Vec::new(),
            transaction_end: None,
            tls,
        };

        if let Err(e) = conn.startup().await {
            conn.state = ConnectionState::Broken;
            return Err(e);
        }

        conn.logger.debug(&format!(
            "Connected to {}:{}/{} as {} (pid {}, tls: {})",
            conn.config.host, conn.config.port, conn.config.database, conn.config.user, conn.backend_pid, conn.tls
        ));
        Ok(conn)
    }

    /// Startup packet, authentication, then server parameters until ReadyForQuery.
    async fn startup(&mut self) -> PgResult<()> {
        let mut options = vec![("client_encoding".to_string(), "UTF8".to_string())];
        if let Some(name) = &self.config.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }
        self.queue(&StartupMessage {
            user: self.config.user.clone(),
            database: Some(self.config.database.clone()),
            options,
        });
        self.flush().await?;
        self.state = ConnectionState::Authenticating;

        let mut scram: Option<ScramClient> = None;

        loop {
            match self.next_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self.require_password()?.to_string();
                    self.queue(&PasswordMessage { password });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let hash = md5_password(&self.config.user, self.require_password()?, &salt);
                    self.queue(&PasswordMessage { password: hash });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(PgError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let client = ScramClient::new(&self.config.user, self.require_password()?);
                    self.queue(&SaslInitialResponseMessage {
                        mechanism: scram::MECHANISM.to_string(),
                        data: client.client_first_message(),
                    });
                    self.flush().await?;
                    scram = Some(client);
                }
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| PgError::protocol("SASLContinue without SASL exchange"))?;
                    let data = client.process_server_first(&data)?;
                    self.queue(&SaslResponseMessage { data });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    let client = scram
                        .as_ref()
                        .ok_or_else(|| PgError::protocol("SASLFinal without SASL exchange"))?;
                    client.verify_server_final(&data)?;
                }
                BackendMessage::AuthenticationUnsupported { code } => {
                    return Err(PgError::Auth(format!(
                        "Unsupported authentication method: {}",
                        auth_method_name(code)
                    )));
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = process_id;
                    self.backend_secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    self.state = ConnectionState::Ready(status);
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = ServerError::from_fields(&fields);
                    if err.code.starts_with(AUTH_SQLSTATE_CLASS) {
                        return Err(PgError::Auth(err.message));
                    }
                    return Err(PgError::Server(err));
                }
                other => return Err(unexpected("startup", &other)),
            }
        }
    }

    fn require_password(&self) -> PgResult<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a statement and buffer its rows.
    ///
    /// SQL text is parsed once per connection and cached; parameter values
    /// are encoded for the types the server assigned to the placeholders.
    pub async fn execute<'q>(&mut self, query: impl Into<Query<'q>>, params: &[PgValue]) -> PgResult<QueryResult> {
        self.enter().await?;
        let result = self.execute_inner(query.into(), params).await;
        self.leave(result)
    }

    async fn execute_inner(&mut self, query: Query<'_>, params: &[PgValue]) -> PgResult<QueryResult> {
        let stmt = self.resolve(query, params).await?;
        self.bind_and_execute(&stmt, params)?;
        self.flush().await?;

        let mut result = QueryResult::new(Arc::clone(&stmt.columns));
        let mut error = None;
        loop {
            match self.next_message().await? {
                BackendMessage::BindComplete | BackendMessage::CloseComplete => {}
                BackendMessage::DataRow { values } => {
                    if error.is_none() {
                        result
                            .rows
                            .push(Row::new(Arc::clone(&stmt.columns), values, Arc::clone(&self.registry)));
                    }
                }
                BackendMessage::CommandComplete { tag } => result.command_tag = tag,
                BackendMessage::EmptyQueryResponse | BackendMessage::PortalSuspended => {}
                BackendMessage::ErrorResponse { fields } => error = Some(ServerError::from_fields(&fields)),
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                other => return Err(unexpected("execute", &other)),
            }
        }

        match error {
            Some(err) => Err(self.statement_error(&stmt, err)),
            None => Ok(result),
        }
    }

    /// Run a statement and stream its rows.
    ///
    /// The connection stays busy until the stream is exhausted or dropped.
    pub async fn query<'q>(&mut self, query: impl Into<Query<'q>>, params: &[PgValue]) -> PgResult<RowStream<'_>> {
        self.enter().await?;
        let columns = match self.start_stream(query.into(), params).await {
            Ok(columns) => columns,
            Err(e) => return self.leave(Err(e)),
        };
        Ok(RowStream::new(self, columns))
    }

    async fn start_stream(&mut self, query: Query<'_>, params: &[PgValue]) -> PgResult<SharedColumns> {
        let stmt = self.resolve(query, params).await?;
        self.bind_and_execute(&stmt, params)?;
        self.flush().await?;

        // Read up to BindComplete so bind errors surface here rather than on the first row
        let mut error = None;
        loop {
            match self.next_message().await? {
                BackendMessage::CloseComplete => {}
                BackendMessage::BindComplete if error.is_none() => return Ok(Arc::clone(&stmt.columns)),
                BackendMessage::ErrorResponse { fields } => error = Some(ServerError::from_fields(&fields)),
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    let err = error.ok_or_else(|| PgError::protocol("ReadyForQuery before BindComplete"))?;
                    return Err(self.statement_error(&stmt, err));
                }
                _ if error.is_some() => {}
                other => return Err(unexpected("bind", &other)),
            }
        }
    }

    /// Next DataRow of a streaming exchange; `None` after ReadyForQuery.
    pub(crate) async fn stream_next(&mut self, command_tag: &mut String) -> PgResult<Option<RowValues>> {
        let mut error = None;
        loop {
            let msg = match self.next_message().await {
                Ok(msg) => msg,
                Err(e) => return self.leave(Err(e)),
            };
            match msg {
                BackendMessage::DataRow { values } if error.is_none() => return Ok(Some(values)),
                BackendMessage::DataRow { .. } => {}
                BackendMessage::CommandComplete { tag } => *command_tag = tag,
                BackendMessage::EmptyQueryResponse | BackendMessage::PortalSuspended => {}
                BackendMessage::ErrorResponse { fields } => error = Some(ServerError::from_fields(&fields)),
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return self.leave(error.map_or(Ok(None), |e| Err(PgError::Server(e))));
                }
                other => return self.leave(Err(unexpected("row stream", &other))),
            }
        }
    }

    pub(crate) fn mark_draining(&mut self) {
        if self.state == ConnectionState::Executing {
            self.state = ConnectionState::Draining;
        }
    }

    /// Run one or more statements with the simple query protocol.
    ///
    /// Results are in text format, one per statement. No parameters.
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.enter().await?;
        let result = self.simple_query_inner(sql).await;
        self.leave(result)
    }

    async fn simple_query_inner(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.queue(&QueryMessage { query: sql.to_string() });
        self.flush().await?;

        let mut results = Vec::new();
        let mut current = QueryResult::new(Arc::new(Vec::new()));
        let mut error = None;
        loop {
            match self.next_message().await? {
                BackendMessage::RowDescription { fields } => {
                    current = QueryResult::new(Arc::new(fields));
                }
                BackendMessage::DataRow { values } => {
                    current
                        .rows
                        .push(Row::new(Arc::clone(&current.columns), values, Arc::clone(&self.registry)));
                }
                BackendMessage::CommandComplete { tag } => {
                    current.command_tag = tag;
                    results.push(std::mem::replace(&mut current, QueryResult::new(Arc::new(Vec::new()))));
                }
                BackendMessage::EmptyQueryResponse => results.push(QueryResult::new(Arc::new(Vec::new()))),
                BackendMessage::ErrorResponse { fields } => error = Some(ServerError::from_fields(&fields)),
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match error {
                        Some(e) => Err(PgError::Server(e)),
                        None => Ok(results),
                    };
                }
                other => return Err(unexpected("simple query", &other)),
            }
        }
    }

    // ========================================================================
    // Prepared statements
    // ========================================================================

    /// Prepare `sql` under `name`, letting the server infer parameter types.
    ///
    /// Preparing an existing name with the same SQL returns the existing
    /// statement; with different SQL it fails with `DuplicateStatement`.
    pub async fn prepare(&mut self, name: &str, sql: &str) -> PgResult<Arc<PreparedStatement>> {
        self.prepare_typed(name, sql, &[]).await
    }

    /// Prepare with explicit parameter types; `Oid::UNSPECIFIED` lets the server choose.
    pub async fn prepare_typed(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> PgResult<Arc<PreparedStatement>> {
        if name.is_empty() || StatementCache::is_reserved_name(name) {
            return Err(PgError::Config(format!("Invalid prepared statement name: {:?}", name)));
        }
        if let Some(existing) = self.statements.named(name) {
            if existing.query == sql {
                return Ok(existing);
            }
            return Err(PgError::DuplicateStatement { name: name.to_string() });
        }
        check_param_limits(param_types.len(), &[])?;

        self.enter().await?;
        let described = self.describe(name.to_string(), sql, param_types).await;
        let stmt = Arc::new(self.leave(described)?);
        self.statements.insert_named(Arc::clone(&stmt));
        self.logger.debug(&format!("Prepared statement {:?}", name));
        Ok(stmt)
    }

    /// Close the named statement on the server. Unknown names are a no-op.
    pub async fn deallocate(&mut self, name: &str) -> PgResult<()> {
        if self.statements.named(name).is_none() {
            return Ok(());
        }

        self.enter().await?;
        let result = self.close_statement(name).await;
        let result = self.leave(result);
        // Gone locally either way; a server-side leftover is harmless
        self.statements.remove_named(name);
        result
    }

    async fn close_statement(&mut self, name: &str) -> PgResult<()> {
        self.queue_pending_closes();
        self.queue(&CloseMessage {
            kind: b'S',
            name: name.to_string(),
        });
        self.queue(&SyncMessage);
        self.flush().await?;
        self.finish_sync("deallocate").await
    }

    pub fn prepared(&self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.statements.named(name)
    }

    /// Find or create the statement to bind.
    async fn resolve(&mut self, query: Query<'_>, params: &[PgValue]) -> PgResult<Arc<PreparedStatement>> {
        match query {
            Query::Prepared(name) => self
                .statements
                .named(name)
                .ok_or_else(|| PgError::StatementNotFound(name.to_string())),
            Query::Sql(sql) => {
                let declared: Vec<Oid> = params.iter().map(PgValue::type_oid).collect();
                check_param_limits(declared.len(), &[])?;
                if let Some(stmt) = self.statements.implicit(sql, &declared) {
                    return Ok(stmt);
                }
                let name = self.statements.next_statement_name();
                let stmt = Arc::new(self.describe(name, sql, &declared).await?);
                self.statements.insert_implicit(declared, Arc::clone(&stmt));
                Ok(stmt)
            }
        }
    }

    /// Parse + Describe(S) + Sync.
    async fn describe(&mut self, name: String, sql: &str, param_types: &[Oid]) -> PgResult<PreparedStatement> {
        self.queue_pending_closes();
        self.queue(&ParseMessage {
            name: name.clone(),
            query: sql.to_string(),
            param_types: param_types.to_vec(),
        });
        self.queue(&DescribeMessage {
            kind: b'S',
            name: name.clone(),
        });
        self.queue(&SyncMessage);
        self.flush().await?;

        let mut stmt = PreparedStatement::new(name, sql.to_string());
        stmt.param_types = param_types.to_vec();
        let mut columns: Vec<FieldDescription> = Vec::new();
        let mut error = None;
        loop {
            match self.next_message().await? {
                BackendMessage::ParseComplete | BackendMessage::CloseComplete | BackendMessage::NoData => {}
                BackendMessage::ParameterDescription { type_oids } => stmt.param_types = type_oids,
                BackendMessage::RowDescription { fields } => columns = fields,
                BackendMessage::ErrorResponse { fields } => error = Some(ServerError::from_fields(&fields)),
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                other => return Err(unexpected("prepare", &other)),
            }
        }
        if let Some(err) = error {
            return Err(PgError::Server(err));
        }

        // Describe reports formats as unknown; pick the ones Bind will request
        for column in &mut columns {
            column.format = self.registry.result_format(column.type_oid);
        }
        stmt.columns = Arc::new(columns);
        Ok(stmt)
    }

    /// Queue Bind + Execute + Sync for `stmt`. Parameters are encoded first,
    /// so an encoding failure leaves nothing half-sent.
    fn bind_and_execute(&mut self, stmt: &PreparedStatement, params: &[PgValue]) -> PgResult<()> {
        if params.len() != stmt.param_count() {
            return Err(PgError::Type(format!(
                "Statement {:?} expects {} parameters, got {}",
                stmt.name,
                stmt.param_count(),
                params.len()
            )));
        }

        let mut param_formats = Vec::with_capacity(params.len());
        let mut values: Vec<Option<Bytes>> = Vec::with_capacity(params.len());
        for (value, oid) in params.iter().zip(&stmt.param_types) {
            if value.is_null() {
                param_formats.push(Format::Text);
                values.push(None);
            } else {
                let (bytes, format) = self.registry.encode(*oid, value)?;
                param_formats.push(format);
                values.push(Some(bytes));
            }
        }

        check_param_limits(values.len(), &values)?;

        self.queue_pending_closes();
        self.queue(&BindMessage {
            portal: String::new(),
            statement: stmt.name.clone(),
            param_formats,
            params: values,
            result_formats: stmt.columns.iter().map(|c| c.format).collect(),
        });
        self.queue(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        });
        self.queue(&SyncMessage);
        Ok(())
    }

    /// Close implicit statements evicted from the cache, ahead of the next exchange.
    fn queue_pending_closes(&mut self) {
        for name in self.statements.take_pending_closes() {
            self.logger.debug(&format!("Closing evicted statement {:?}", name));
            self.queue(&CloseMessage { kind: b'S', name });
        }
    }

    fn statement_error(&mut self, stmt: &PreparedStatement, err: ServerError) -> PgError {
        if err.code == UNKNOWN_STATEMENT_SQLSTATE {
            // Deallocated behind our back (DEALLOCATE ALL, DISCARD ALL)
            self.statements.forget(&stmt.name);
        }
        PgError::Server(err)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&mut self) -> PgResult<()> {
        self.simple_query("BEGIN").await.map(|_| ())
    }

    /// COMMIT; `false` when the server rolled back instead (failed transaction).
    pub async fn commit(&mut self) -> PgResult<bool> {
        let results = self.simple_query("COMMIT").await?;
        Ok(results.last().map(|r| r.command_tag == "COMMIT").unwrap_or(false))
    }

    pub async fn rollback(&mut self) -> PgResult<()> {
        self.simple_query("ROLLBACK").await.map(|_| ())
    }

    // ========================================================================
    // LISTEN / NOTIFY
    // ========================================================================

    /// Subscribe to `channel`. Repeated calls for the same channel do nothing.
    ///
    /// Inside a transaction block the subscription takes effect on COMMIT
    /// and is dropped on ROLLBACK.
    pub async fn listen(&mut self, channel: &str) -> PgResult<()> {
        if self.will_listen(channel) {
            return Ok(());
        }
        self.simple_query(&format!("LISTEN {}", quote_identifier(channel))).await?;
        self.record_listen_change(ListenChange::Listen(channel.to_string()));
        Ok(())
    }

    pub async fn unlisten(&mut self, channel: &str) -> PgResult<()> {
        if !self.will_listen(channel) {
            return Ok(());
        }
        self.simple_query(&format!("UNLISTEN {}", quote_identifier(channel))).await?;
        self.record_listen_change(ListenChange::Unlisten(channel.to_string()));
        Ok(())
    }

    pub async fn unlisten_all(&mut self) -> PgResult<()> {
        self.simple_query("UNLISTEN *").await?;
        self.record_listen_change(ListenChange::UnlistenAll);
        Ok(())
    }

    /// Whether `channel` is subscribed once the open transaction commits.
    fn will_listen(&self, channel: &str) -> bool {
        self.pending_listens
            .iter()
            .rev()
            .find_map(|change| match change {
                ListenChange::Listen(c) if c == channel => Some(true),
                ListenChange::Unlisten(c) if c == channel => Some(false),
                ListenChange::UnlistenAll => Some(false),
                _ => None,
            })
            .unwrap_or_else(|| self.listening.contains(channel))
    }

    fn record_listen_change(&mut self, change: ListenChange) {
        if self.transaction_status == TransactionStatus::Idle {
            change.apply(&mut self.listening);
        } else {
            self.pending_listens.push(change);
        }
    }

    /// Settle staged LISTEN/UNLISTEN once the transaction block has ended.
    fn end_transaction_block(&mut self) {
        let committed = self.transaction_end.take() == Some(true);
        let changes = std::mem::take(&mut self.pending_listens);
        if committed {
            for change in changes {
                change.apply(&mut self.listening);
            }
        } else if !changes.is_empty() {
            self.logger.debug("Transaction rolled back; discarding LISTEN/UNLISTEN changes");
        }
    }

    /// Send a notification through `pg_notify`.
    pub async fn notify(&mut self, channel: &str, payload: &str) -> PgResult<()> {
        self.execute(
            "SELECT pg_notify($1, $2)",
            &[PgValue::from(channel), PgValue::from(payload)],
        )
        .await
        .map(|_| ())
    }

    /// Next notification: a queued one if any, else wait up to `timeout`.
    ///
    /// Cancel-safe: dropping the future loses no partially received message.
    pub async fn wait_for_notification(&mut self, timeout: Duration) -> PgResult<Notification> {
        if let Some(n) = self.notifications.pop_front() {
            return Ok(n);
        }
        self.settle().await?;
        if !matches!(self.state, ConnectionState::Ready(_)) {
            return Err(self.unusable());
        }

        let result = match tokio::time::timeout(timeout, self.read_notification()).await {
            Ok(result) => result,
            Err(_) => Err(PgError::Timeout),
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                self.state = ConnectionState::Broken;
            }
        }
        result
    }

    async fn read_notification(&mut self) -> PgResult<Notification> {
        loop {
            match self.read_message().await? {
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    return Ok(Notification {
                        process_id,
                        channel,
                        payload,
                    })
                }
                BackendMessage::NoticeResponse { fields } => self.log_notice(&fields),
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ErrorResponse { fields } => {
                    // Unsolicited errors are FATAL (e.g. admin shutdown); the session is over
                    let err = ServerError::from_fields(&fields);
                    self.state = ConnectionState::Broken;
                    return Err(PgError::Connection(err.to_string()));
                }
                other => return Err(unexpected("idle", &other)),
            }
        }
    }

    /// Notifications received so far, without waiting.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// Subscribed as of the last commit.
    pub fn is_listening(&self, channel: &str) -> bool {
        self.listening.contains(channel)
    }

    pub fn has_listeners(&self) -> bool {
        !self.listening.is_empty()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Send Terminate and shut the socket down. Always ends `Closed`.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.write_buffer.clear();
        self.queue(&TerminateMessage);
        // Best effort: the peer may already be gone
        let _ = self.flush().await;
        let _ = self.writer.shutdown().await;

        self.state = ConnectionState::Closed;
        self.statements.clear();
        self.listening.clear();
        self.pending_listens.clear();
        self.logger.debug(&format!("Connection to pid {} closed", self.backend_pid));
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Ready for a new exchange (possibly after draining an abandoned stream).
    pub fn is_usable(&self) -> bool {
        matches!(self.state, ConnectionState::Ready(_) | ConnectionState::Draining)
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn backend_secret_key(&self) -> i32 {
        self.backend_secret_key
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.parameter("server_version")
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub(crate) fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    // ========================================================================
    // Exchange bookkeeping
    // ========================================================================

    /// Discard what an abandoned row stream left behind.
    async fn settle(&mut self) -> PgResult<()> {
        if self.state != ConnectionState::Draining {
            return Ok(());
        }
        self.state = ConnectionState::Executing;
        let drained = self.discard_until_ready().await;
        self.leave(drained)
    }

    async fn discard_until_ready(&mut self) -> PgResult<()> {
        loop {
            match self.next_message().await? {
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = ServerError::from_fields(&fields);
                    self.logger.debug(&format!("Discarded error from abandoned stream: {}", err));
                }
                _ => {}
            }
        }
    }

    /// Start an exchange.
    async fn enter(&mut self) -> PgResult<()> {
        self.settle().await?;
        match self.state {
            ConnectionState::Ready(_) => {
                self.state = ConnectionState::Executing;
                Ok(())
            }
            _ => Err(self.unusable()),
        }
    }

    /// End an exchange: fatal errors break the connection, anything else
    /// returns it to `Ready` with the last reported transaction status.
    fn leave<T>(&mut self, result: PgResult<T>) -> PgResult<T> {
        match &result {
            Err(e) if e.is_fatal() => {
                if self.state != ConnectionState::Broken {
                    self.logger.warning(&format!("Connection to pid {} broken: {}", self.backend_pid, e));
                }
                self.state = ConnectionState::Broken;
                self.write_buffer.clear();
            }
            _ => self.state = ConnectionState::Ready(self.transaction_status),
        }
        result
    }

    fn unusable(&self) -> PgError {
        match self.state {
            ConnectionState::Closed => PgError::ConnectionClosed,
            state => PgError::Connection(format!("Connection is not usable (state: {:?})", state)),
        }
    }

    /// Wait for the ReadyForQuery closing a Sync-terminated exchange with no rows.
    async fn finish_sync(&mut self, what: &str) -> PgResult<()> {
        let mut error = None;
        loop {
            match self.next_message().await? {
                BackendMessage::CloseComplete | BackendMessage::ParseComplete => {}
                BackendMessage::ErrorResponse { fields } => error = Some(ServerError::from_fields(&fields)),
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return error.map_or(Ok(()), |e| Err(PgError::Server(e)));
                }
                other => return Err(unexpected(what, &other)),
            }
        }
    }

    // ========================================================================
    // Message I/O
    // ========================================================================

    fn queue<M: FrontendMessage>(&mut self, msg: &M) {
        self.write_buffer.extend_from_slice(&msg.encode());
    }

    async fn flush(&mut self) -> PgResult<()> {
        if !self.write_buffer.is_empty() {
            self.writer.write_all(&self.write_buffer).await?;
            self.write_buffer.clear();
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one complete message. Cancel-safe.
    async fn read_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(msg) = BackendMessage::decode(&mut self.read_buffer)? {
                return Ok(msg);
            }
            if self.read_buffer.capacity() - self.read_buffer.len() < 4096 {
                self.read_buffer.reserve(4096);
            }
            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(PgError::Connection("Server closed the connection".to_string()));
            }
        }
    }

    /// Read the next message belonging to the current exchange, absorbing
    /// asynchronous ones (notifications, notices, parameter changes).
    async fn next_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            match self.read_message().await? {
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => self.notifications.push_back(Notification {
                    process_id,
                    channel,
                    payload,
                }),
                BackendMessage::NoticeResponse { fields } => self.log_notice(&fields),
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                msg => {
                    self.observe_transaction(&msg);
                    return Ok(msg);
                }
            }
        }
    }

    /// Track how a transaction block ends, for staged LISTEN changes.
    fn observe_transaction(&mut self, msg: &BackendMessage) {
        match msg {
            BackendMessage::CommandComplete { tag } if tag == "COMMIT" => self.transaction_end = Some(true),
            BackendMessage::CommandComplete { tag } if tag == "ROLLBACK" => self.transaction_end = Some(false),
            BackendMessage::ReadyForQuery { status } => {
                if *status == TransactionStatus::Idle && !self.pending_listens.is_empty() {
                    self.end_transaction_block();
                }
                self.transaction_end = None;
            }
            _ => {}
        }
    }

    fn log_notice(&self, fields: &HashMap<u8, String>) {
        let notice = ServerError::from_fields(fields);
        let line = format!("{}: {}", notice.severity, notice.message);
        if notice.severity == "WARNING" {
            self.logger.warning(&line);
        } else {
            self.logger.info(&line);
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// `md5` + hex(MD5(hex(MD5(password + user)) + salt))
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}

fn auth_method_name(code: i32) -> &'static str {
    match code {
        2 => "Kerberos V5",
        6 => "SCM credentials",
        7 => "GSSAPI",
        8 => "GSSAPI continue",
        9 => "SSPI",
        _ => "unknown",
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub(crate) fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn unexpected(during: &str, msg: &BackendMessage) -> PgError {
    PgError::protocol(format!("Unexpected message during {}: {:?}", during, msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password() {
        // md5(md5("secret" + "alice") + salt), computed independently
        let inner = format!("{:x}", md5::compute("secretalice"));
        let mut outer = inner.into_bytes();
        outer.extend_from_slice(&[1, 2, 3, 4]);
        let expected = format!("md5{:x}", md5::compute(&outer));

        let hash = md5_password("alice", "secret", &[1, 2, 3, 4]);
        assert_eq!(hash, expected);
        assert_eq!(hash.len(), 35);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("jobs"), "\"jobs\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_query_from_prepared() {
        let stmt = PreparedStatement::new("by_id".into(), "SELECT 1".into());
        assert!(matches!(Query::from(&stmt), Query::Prepared("by_id")));
        assert!(matches!(Query::from("SELECT 1"), Query::Sql("SELECT 1")));
    }
}
