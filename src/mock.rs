//! Scripted PostgreSQL backend for tests.
//!
//! Speaks enough of protocol 3.0 over a local socket to drive the client:
//! it refuses SSL, runs the password flows, and answers simple and extended
//! queries from a small fixed SQL vocabulary. Sessions share an `items`
//! table (with per-transaction pending rows) and a LISTEN/NOTIFY hub.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PgConfig;
use crate::protocol::SSL_REQUEST_CODE;
use crate::scram::ScramServer;
use crate::types::Oid;

pub(crate) const USER: &str = "tester";
pub(crate) const PASSWORD: &str = "s3cret";
const DATABASE: &str = "test";
const FIRST_PID: i32 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockAuth {
    Trust,
    Cleartext,
    Md5,
    Scram,
    /// Requests GSSAPI, which the client does not implement.
    Gss,
}

type Delivery = (i32, String, String);

struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Shared {
    items: Mutex<Vec<i32>>,
    subscribers: Mutex<HashMap<i32, Subscriber>>,
    accepted: AtomicUsize,
    sessions: AtomicI32,
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    auth: MockAuth,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockServer {
    pub(crate) async fn start() -> Self {
        Self::with_auth(MockAuth::Trust).await
    }

    pub(crate) async fn with_auth(auth: MockAuth) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock backend");
        let addr = listener.local_addr().expect("mock backend address");
        let shared = Arc::new(Shared::default());

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    let _ = Session::run(socket, auth, shared).await;
                });
            }
        });

        Self {
            addr,
            auth,
            shared,
            task,
        }
    }

    /// Client settings for this backend, with the password when auth needs one.
    pub(crate) fn config(&self) -> PgConfig {
        let config = PgConfig::default()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user(USER)
            .database(DATABASE);
        match self.auth {
            MockAuth::Trust => config,
            _ => config.password(PASSWORD),
        }
    }

    pub(crate) fn url(&self) -> String {
        format!(
            "postgresql://{}:{}@127.0.0.1:{}/{}?sslmode=prefer",
            USER,
            PASSWORD,
            self.addr.port(),
            DATABASE
        )
    }

    /// Sockets accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Committed rows of `items`.
    pub(crate) fn items(&self) -> Vec<i32> {
        self.shared.items.lock().clone()
    }
}

// ============================================================================
// Query vocabulary
// ============================================================================

#[derive(Debug, Clone)]
enum Cell {
    Int4(i32),
    Int8(i64),
    Text(String),
    Null,
}

impl Cell {
    fn encode(&self, format: i16) -> Option<Vec<u8>> {
        let binary = format == 1;
        match self {
            Cell::Int4(v) if binary => Some(v.to_be_bytes().to_vec()),
            Cell::Int8(v) if binary => Some(v.to_be_bytes().to_vec()),
            Cell::Int4(v) => Some(v.to_string().into_bytes()),
            Cell::Int8(v) => Some(v.to_string().into_bytes()),
            Cell::Text(s) => Some(s.clone().into_bytes()),
            Cell::Null => None,
        }
    }
}

enum Outcome {
    Rows {
        columns: Vec<(&'static str, Oid)>,
        rows: Vec<Vec<Cell>>,
        tag: String,
    },
    Command(String),
    Empty,
    Error(&'static str, String),
    /// Drop the socket without a reply.
    Hangup,
    /// Reply with a frame whose length is shorter than its header.
    Garbled,
}

type Param = Option<(i16, Vec<u8>)>;

fn is_command(sql: &str) -> bool {
    matches!(
        sql,
        "" | "BEGIN" | "COMMIT" | "ROLLBACK" | "DEALLOCATE ALL" | "INSERT INTO items VALUES ($1)" | "BROKEN" | "GARBLED"
    ) || sql.starts_with("BEGIN ISOLATION LEVEL ")
        || sql.starts_with("LISTEN ")
        || sql.starts_with("UNLISTEN ")
        || sql.starts_with("SET application_name TO ")
}

/// Result columns of a known statement; `None` for SQL the backend rejects.
fn columns_of(sql: &str) -> Option<Vec<(&'static str, Oid)>> {
    let columns = match sql {
        "SELECT 1" => vec![("?column?", Oid::INT4)],
        "SELECT $1::int4 AS n" | "SELECT NULL::int4 AS n" | "SELECT generate_series(1, 5) AS n" => {
            vec![("n", Oid::INT4)]
        }
        "SELECT $1::text AS t" => vec![("t", Oid::TEXT)],
        "SELECT count(*) FROM items" => vec![("count", Oid::INT8)],
        "SELECT pg_notify($1, $2)" => vec![("pg_notify", Oid::VOID)],
        _ if is_command(sql) => vec![],
        _ => return None,
    };
    Some(columns)
}

fn inferred_param_types(sql: &str) -> Vec<Oid> {
    match sql {
        "SELECT $1::int4 AS n" | "INSERT INTO items VALUES ($1)" => vec![Oid::INT4],
        "SELECT $1::text AS t" => vec![Oid::TEXT],
        "SELECT pg_notify($1, $2)" => vec![Oid::TEXT, Oid::TEXT],
        _ => vec![],
    }
}

fn param_int(param: Option<&Param>) -> Option<i64> {
    let (format, data) = param?.as_ref()?;
    if *format == 1 {
        match data.len() {
            2 => Some(i16::from_be_bytes([data[0], data[1]]).into()),
            4 => Some(i32::from_be_bytes([data[0], data[1], data[2], data[3]]).into()),
            8 => Some(i64::from_be_bytes(data[..8].try_into().ok()?)),
            _ => None,
        }
    } else {
        std::str::from_utf8(data).ok()?.parse().ok()
    }
}

fn param_text(param: Option<&Param>) -> Option<String> {
    let (_, data) = param?.as_ref()?;
    Some(String::from_utf8_lossy(data).into_owned())
}

fn unquote(ident: &str) -> String {
    match ident.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => ident.to_lowercase(),
    }
}

fn pick_format(formats: &[i16], idx: usize) -> i16 {
    match formats.len() {
        0 => 0,
        1 => formats[0],
        _ => formats.get(idx).copied().unwrap_or(0),
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

fn frame(out: &mut BytesMut, tag: u8, fill: impl FnOnce(&mut BytesMut)) {
    out.put_u8(tag);
    let at = out.len();
    out.put_i32(0);
    fill(out);
    let len = (out.len() - at) as i32;
    out[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn get_cstr(body: &mut Bytes) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let s = String::from_utf8_lossy(&body[..end]).into_owned();
    body.advance((end + 1).min(body.len()));
    s
}

// ============================================================================
// Session
// ============================================================================

struct Statement {
    sql: String,
    param_types: Vec<Oid>,
}

struct Portal {
    sql: String,
    params: Vec<Param>,
    result_formats: Vec<i16>,
}

struct Session {
    socket: TcpStream,
    input: BytesMut,
    out: BytesMut,
    shared: Arc<Shared>,
    pid: i32,
    status: u8,
    pending_items: Vec<i32>,
    pending_notifications: Vec<(String, String)>,
    /// LISTEN/UNLISTEN commands issued inside the open transaction.
    pending_listens: Vec<String>,
    statements: HashMap<String, Statement>,
    portal: Option<Portal>,
    skipping: bool,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Session {
    async fn run(socket: TcpStream, auth: MockAuth, shared: Arc<Shared>) -> io::Result<()> {
        let pid = FIRST_PID + shared.sessions.fetch_add(1, Ordering::SeqCst);
        let (tx, deliveries) = mpsc::unbounded_channel();
        shared.subscribers.lock().insert(
            pid,
            Subscriber {
                channels: HashSet::new(),
                tx,
            },
        );

        let mut session = Session {
            socket,
            input: BytesMut::with_capacity(4096),
            out: BytesMut::with_capacity(4096),
            shared: Arc::clone(&shared),
            pid,
            status: b'I',
            pending_items: Vec::new(),
            pending_notifications: Vec::new(),
            pending_listens: Vec::new(),
            statements: HashMap::new(),
            portal: None,
            skipping: false,
            deliveries,
        };
        let result = session.serve(auth).await;
        shared.subscribers.lock().remove(&pid);
        result
    }

    async fn serve(&mut self, auth: MockAuth) -> io::Result<()> {
        let Some(params) = self.startup().await? else {
            return Ok(());
        };
        let user = params.get("user").cloned().unwrap_or_default();
        if !self.authenticate(auth, &user).await? {
            return Ok(());
        }

        self.auth_request(0, &[]);
        self.parameter_status("server_version", "16.4");
        self.parameter_status("server_encoding", "UTF8");
        let encoding = params.get("client_encoding").map_or("SQL_ASCII", String::as_str).to_string();
        self.parameter_status("client_encoding", &encoding);
        if let Some(name) = params.get("application_name").cloned() {
            self.parameter_status("application_name", &name);
        }
        let pid = self.pid;
        frame(&mut self.out, b'K', |b| {
            b.put_i32(pid);
            b.put_i32(0x5eed);
        });
        self.ready();
        self.flush().await?;

        loop {
            if let Some((tag, body)) = self.take_frame() {
                if !self.handle(tag, body).await? {
                    return Ok(());
                }
                continue;
            }
            tokio::select! {
                biased;
                Some((sender, channel, payload)) = self.deliveries.recv() => {
                    frame(&mut self.out, b'A', |b| {
                        b.put_i32(sender);
                        put_cstr(b, &channel);
                        put_cstr(b, &payload);
                    });
                    self.flush().await?;
                }
                read = self.socket.read_buf(&mut self.input) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Startup and authentication
    // ------------------------------------------------------------------------

    async fn startup(&mut self) -> io::Result<Option<HashMap<String, String>>> {
        loop {
            let Some(mut body) = self.untagged_frame().await? else {
                return Ok(None);
            };
            let code = body.get_i32();
            if code == SSL_REQUEST_CODE {
                self.socket.write_all(b"N").await?;
                continue;
            }

            let mut params = HashMap::new();
            loop {
                let key = get_cstr(&mut body);
                if key.is_empty() {
                    break;
                }
                params.insert(key, get_cstr(&mut body));
            }
            return Ok(Some(params));
        }
    }

    async fn authenticate(&mut self, auth: MockAuth, user: &str) -> io::Result<bool> {
        match auth {
            MockAuth::Trust => Ok(true),
            MockAuth::Cleartext => {
                self.auth_request(3, &[]);
                self.flush().await?;
                let Some((b'p', mut body)) = self.next_frame().await? else {
                    return Ok(false);
                };
                if get_cstr(&mut body) != PASSWORD {
                    return self.reject(user).await;
                }
                Ok(true)
            }
            MockAuth::Md5 => {
                let salt = [9u8, 8, 7, 6];
                self.auth_request(5, &salt);
                self.flush().await?;
                let Some((b'p', mut body)) = self.next_frame().await? else {
                    return Ok(false);
                };
                let inner = format!("{:x}", md5::compute(format!("{}{}", PASSWORD, user)));
                let expected = format!("md5{:x}", md5::compute([inner.as_bytes(), &salt[..]].concat()));
                if get_cstr(&mut body) != expected {
                    return self.reject(user).await;
                }
                Ok(true)
            }
            MockAuth::Scram => {
                self.auth_request(10, b"SCRAM-SHA-256\0\0");
                self.flush().await?;
                let Some((b'p', mut body)) = self.next_frame().await? else {
                    return Ok(false);
                };
                let _mechanism = get_cstr(&mut body);
                let len = body.get_i32().max(0) as usize;
                let client_first = body.split_to(len.min(body.len()));

                let mut server = ScramServer::new(PASSWORD);
                let Some(server_first) = server.first(&client_first) else {
                    return self.reject(user).await;
                };
                self.auth_request(11, server_first.as_bytes());
                self.flush().await?;

                let Some((b'p', client_final)) = self.next_frame().await? else {
                    return Ok(false);
                };
                let Some(server_final) = server.finish(&client_final) else {
                    return self.reject(user).await;
                };
                self.auth_request(12, server_final.as_bytes());
                Ok(true)
            }
            MockAuth::Gss => {
                self.auth_request(7, &[]);
                self.flush().await?;
                Ok(false)
            }
        }
    }

    async fn reject(&mut self, user: &str) -> io::Result<bool> {
        self.error_with("FATAL", "28P01", &format!("password authentication failed for user \"{}\"", user));
        self.flush().await?;
        Ok(false)
    }

    // ------------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------------

    /// Returns `false` when the session should end.
    async fn handle(&mut self, tag: u8, mut body: Bytes) -> io::Result<bool> {
        if self.skipping && !matches!(tag, b'S' | b'X') {
            return Ok(true);
        }
        match tag {
            b'Q' => {
                let sql = get_cstr(&mut body);
                if !self.simple_query(&sql) {
                    return Ok(false);
                }
                self.ready();
                self.flush().await?;
            }
            b'P' => self.parse(body),
            b'D' => self.describe(body),
            b'B' => self.bind(body),
            b'E' => {
                if !self.execute() {
                    return Ok(false);
                }
            }
            b'C' => {
                let _kind = body.get_u8();
                let name = get_cstr(&mut body);
                self.statements.remove(&name);
                frame(&mut self.out, b'3', |_| {});
            }
            b'S' => {
                self.skipping = false;
                self.portal = None;
                self.ready();
                self.flush().await?;
            }
            b'H' => self.flush().await?,
            b'X' => return Ok(false),
            other => {
                self.error("08P01", &format!("invalid frontend message type {}", other));
                self.skipping = true;
            }
        }
        Ok(true)
    }

    fn simple_query(&mut self, sql: &str) -> bool {
        let statements: Vec<String> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if statements.is_empty() {
            frame(&mut self.out, b'I', |_| {});
            return true;
        }

        for sql in statements {
            let outcome = match columns_of(&sql) {
                Some(_) => self.run_sql(&sql, &[]),
                None => syntax_error(&sql),
            };
            match outcome {
                Outcome::Rows { columns, rows, tag } => {
                    self.row_description(&columns, &[]);
                    for row in &rows {
                        self.data_row(row, &[]);
                    }
                    self.command_complete(&tag);
                }
                Outcome::Command(tag) => self.command_complete(&tag),
                Outcome::Empty => frame(&mut self.out, b'I', |_| {}),
                Outcome::Error(code, message) => {
                    self.error(code, &message);
                    return true;
                }
                Outcome::Hangup => return false,
                Outcome::Garbled => {
                    self.garbled();
                    return true;
                }
            }
        }
        true
    }

    fn parse(&mut self, mut body: Bytes) {
        let name = get_cstr(&mut body);
        let sql = get_cstr(&mut body);
        let count = body.get_i16().max(0) as usize;
        let declared: Vec<Oid> = (0..count).map(|_| Oid(body.get_u32())).collect();

        if !name.is_empty() && self.statements.contains_key(&name) {
            self.error("42P05", &format!("prepared statement \"{}\" already exists", name));
            self.skipping = true;
            return;
        }
        if columns_of(&sql).is_none() {
            if let Outcome::Error(code, message) = syntax_error(&sql) {
                self.error(code, &message);
            }
            self.skipping = true;
            return;
        }

        let mut param_types = inferred_param_types(&sql);
        if declared.len() > param_types.len() {
            param_types.resize(declared.len(), Oid::TEXT);
        }
        for (slot, oid) in param_types.iter_mut().zip(&declared) {
            if *oid != Oid::UNSPECIFIED {
                *slot = *oid;
            }
        }
        self.statements.insert(name, Statement { sql, param_types });
        frame(&mut self.out, b'1', |_| {});
    }

    fn describe(&mut self, mut body: Bytes) {
        let _kind = body.get_u8();
        let name = get_cstr(&mut body);
        let Some(stmt) = self.statements.get(&name) else {
            self.error("26000", &format!("prepared statement \"{}\" does not exist", name));
            self.skipping = true;
            return;
        };
        let param_types = stmt.param_types.clone();
        let columns = columns_of(&stmt.sql).unwrap_or_default();

        frame(&mut self.out, b't', |b| {
            b.put_i16(param_types.len() as i16);
            for oid in &param_types {
                b.put_u32(oid.0);
            }
        });
        if columns.is_empty() {
            frame(&mut self.out, b'n', |_| {});
        } else {
            self.row_description(&columns, &[]);
        }
    }

    fn bind(&mut self, mut body: Bytes) {
        let _portal = get_cstr(&mut body);
        let name = get_cstr(&mut body);
        let format_count = body.get_i16().max(0) as usize;
        let param_formats: Vec<i16> = (0..format_count).map(|_| body.get_i16()).collect();
        let param_count = body.get_i16().max(0) as usize;
        let mut params = Vec::with_capacity(param_count);
        for idx in 0..param_count {
            let len = body.get_i32();
            if len < 0 {
                params.push(None);
            } else {
                let data = body.split_to(len as usize).to_vec();
                params.push(Some((pick_format(&param_formats, idx), data)));
            }
        }
        let result_count = body.get_i16().max(0) as usize;
        let result_formats = (0..result_count).map(|_| body.get_i16()).collect();

        let Some(stmt) = self.statements.get(&name) else {
            self.error("26000", &format!("prepared statement \"{}\" does not exist", name));
            self.skipping = true;
            return;
        };
        if params.len() != stmt.param_types.len() {
            let message = format!(
                "bind message supplies {} parameters, but prepared statement \"{}\" requires {}",
                params.len(),
                name,
                stmt.param_types.len()
            );
            self.error("08P01", &message);
            self.skipping = true;
            return;
        }
        self.portal = Some(Portal {
            sql: stmt.sql.clone(),
            params,
            result_formats,
        });
        frame(&mut self.out, b'2', |_| {});
    }

    /// Returns `false` to hang up.
    fn execute(&mut self) -> bool {
        let Some(portal) = self.portal.take() else {
            self.error("34000", "portal \"\" does not exist");
            self.skipping = true;
            return true;
        };
        match self.run_sql(&portal.sql, &portal.params) {
            Outcome::Rows { rows, tag, .. } => {
                for row in &rows {
                    self.data_row(row, &portal.result_formats);
                }
                self.command_complete(&tag);
            }
            Outcome::Command(tag) => self.command_complete(&tag),
            Outcome::Empty => frame(&mut self.out, b'I', |_| {}),
            Outcome::Error(code, message) => {
                self.error(code, &message);
                self.skipping = true;
            }
            Outcome::Hangup => return false,
            Outcome::Garbled => self.garbled(),
        }
        true
    }

    // ------------------------------------------------------------------------
    // Statement execution
    // ------------------------------------------------------------------------

    fn run_sql(&mut self, sql: &str, params: &[Param]) -> Outcome {
        if self.status == b'E' && sql != "COMMIT" && sql != "ROLLBACK" {
            return Outcome::Error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block".to_string(),
            );
        }

        let single = |columns: Vec<(&'static str, Oid)>, row: Vec<Cell>| Outcome::Rows {
            columns,
            rows: vec![row],
            tag: "SELECT 1".to_string(),
        };

        match sql {
            "" => Outcome::Empty,
            "BROKEN" => Outcome::Hangup,
            "GARBLED" => Outcome::Garbled,
            "SELECT 1" => single(vec![("?column?", Oid::INT4)], vec![Cell::Int4(1)]),
            "SELECT $1::int4 AS n" => {
                let cell = param_int(params.first()).map_or(Cell::Null, |v| Cell::Int4(v as i32));
                single(vec![("n", Oid::INT4)], vec![cell])
            }
            "SELECT NULL::int4 AS n" => single(vec![("n", Oid::INT4)], vec![Cell::Null]),
            "SELECT $1::text AS t" => {
                let cell = param_text(params.first()).map_or(Cell::Null, Cell::Text);
                single(vec![("t", Oid::TEXT)], vec![cell])
            }
            "SELECT generate_series(1, 5) AS n" => Outcome::Rows {
                columns: vec![("n", Oid::INT4)],
                rows: (1..=5).map(|n| vec![Cell::Int4(n)]).collect(),
                tag: "SELECT 5".to_string(),
            },
            "SELECT count(*) FROM items" => {
                let count = self.shared.items.lock().len() + self.pending_items.len();
                single(vec![("count", Oid::INT8)], vec![Cell::Int8(count as i64)])
            }
            "INSERT INTO items VALUES ($1)" => {
                let value = param_int(params.first()).unwrap_or_default() as i32;
                if self.status == b'T' {
                    self.pending_items.push(value);
                } else {
                    self.shared.items.lock().push(value);
                }
                Outcome::Command("INSERT 0 1".to_string())
            }
            "SELECT pg_notify($1, $2)" => {
                let channel = param_text(params.first()).unwrap_or_default();
                let payload = param_text(params.get(1)).unwrap_or_default();
                if self.status == b'T' {
                    self.pending_notifications.push((channel, payload));
                } else {
                    self.publish(&channel, &payload);
                }
                single(vec![("pg_notify", Oid::VOID)], vec![Cell::Text(String::new())])
            }
            "BEGIN" => self.begin(),
            "COMMIT" => {
                if self.status == b'E' {
                    self.end_transaction(false);
                    return Outcome::Command("ROLLBACK".to_string());
                }
                if self.status == b'I' {
                    self.notice("there is no transaction in progress");
                }
                self.end_transaction(true);
                Outcome::Command("COMMIT".to_string())
            }
            "ROLLBACK" => {
                self.end_transaction(false);
                Outcome::Command("ROLLBACK".to_string())
            }
            "DEALLOCATE ALL" => {
                self.statements.clear();
                Outcome::Command("DEALLOCATE ALL".to_string())
            }
            _ if sql.starts_with("BEGIN ISOLATION LEVEL ") => self.begin(),
            _ if sql.starts_with("LISTEN ") || sql.starts_with("UNLISTEN ") => {
                let tag = if sql.starts_with("LISTEN ") { "LISTEN" } else { "UNLISTEN" };
                if self.status == b'T' {
                    self.pending_listens.push(sql.to_string());
                } else {
                    self.apply_listen(sql);
                }
                Outcome::Command(tag.to_string())
            }
            _ if sql.starts_with("SET application_name TO ") => {
                let value = sql["SET application_name TO ".len()..].trim_matches('\'').to_string();
                self.parameter_status("application_name", &value);
                Outcome::Command("SET".to_string())
            }
            _ => syntax_error(sql),
        }
    }

    fn begin(&mut self) -> Outcome {
        if self.status != b'I' {
            self.notice("there is already a transaction in progress");
        }
        self.status = b'T';
        Outcome::Command("BEGIN".to_string())
    }

    fn end_transaction(&mut self, commit: bool) {
        let items = std::mem::take(&mut self.pending_items);
        let notifications = std::mem::take(&mut self.pending_notifications);
        let listens = std::mem::take(&mut self.pending_listens);
        if commit {
            self.shared.items.lock().extend(items);
            for sql in &listens {
                self.apply_listen(sql);
            }
            for (channel, payload) in notifications {
                self.publish(&channel, &payload);
            }
        }
        self.status = b'I';
    }

    fn apply_listen(&self, sql: &str) {
        let mut subscribers = self.shared.subscribers.lock();
        let Some(sub) = subscribers.get_mut(&self.pid) else {
            return;
        };
        if let Some(channel) = sql.strip_prefix("LISTEN ") {
            sub.channels.insert(unquote(channel));
        } else if let Some(target) = sql.strip_prefix("UNLISTEN ") {
            if target == "*" {
                sub.channels.clear();
            } else {
                sub.channels.remove(&unquote(target));
            }
        }
    }

    fn publish(&self, channel: &str, payload: &str) {
        for sub in self.shared.subscribers.lock().values() {
            if sub.channels.contains(channel) {
                let _ = sub.tx.send((self.pid, channel.to_string(), payload.to_string()));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Outgoing messages
    // ------------------------------------------------------------------------

    fn auth_request(&mut self, code: i32, extra: &[u8]) {
        frame(&mut self.out, b'R', |b| {
            b.put_i32(code);
            b.put_slice(extra);
        });
    }

    /// A ReadyForQuery header claiming a 2-byte length.
    fn garbled(&mut self) {
        self.out.put_u8(b'Z');
        self.out.put_i32(2);
    }

    fn parameter_status(&mut self, name: &str, value: &str) {
        frame(&mut self.out, b'S', |b| {
            put_cstr(b, name);
            put_cstr(b, value);
        });
    }

    fn ready(&mut self) {
        let status = self.status;
        frame(&mut self.out, b'Z', |b| b.put_u8(status));
    }

    fn error(&mut self, code: &str, message: &str) {
        self.error_with("ERROR", code, message);
        if self.status == b'T' {
            self.status = b'E';
        }
    }

    fn error_with(&mut self, severity: &str, code: &str, message: &str) {
        frame(&mut self.out, b'E', |b| {
            for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
                b.put_u8(field);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }

    fn notice(&mut self, message: &str) {
        frame(&mut self.out, b'N', |b| {
            for (field, value) in [(b'S', "WARNING"), (b'V', "WARNING"), (b'C', "25001"), (b'M', message)] {
                b.put_u8(field);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }

    fn row_description(&mut self, columns: &[(&str, Oid)], formats: &[i16]) {
        frame(&mut self.out, b'T', |b| {
            b.put_i16(columns.len() as i16);
            for (idx, (name, oid)) in columns.iter().enumerate() {
                put_cstr(b, name);
                b.put_u32(0);
                b.put_i16(0);
                b.put_u32(oid.0);
                b.put_i16(-1);
                b.put_i32(-1);
                b.put_i16(pick_format(formats, idx));
            }
        });
    }

    fn data_row(&mut self, cells: &[Cell], formats: &[i16]) {
        frame(&mut self.out, b'D', |b| {
            b.put_i16(cells.len() as i16);
            for (idx, cell) in cells.iter().enumerate() {
                match cell.encode(pick_format(formats, idx)) {
                    Some(data) => {
                        b.put_i32(data.len() as i32);
                        b.put_slice(&data);
                    }
                    None => b.put_i32(-1),
                }
            }
        });
    }

    fn command_complete(&mut self, tag: &str) {
        frame(&mut self.out, b'C', |b| put_cstr(b, tag));
    }

    // ------------------------------------------------------------------------
    // Socket I/O
    // ------------------------------------------------------------------------

    async fn flush(&mut self) -> io::Result<()> {
        if !self.out.is_empty() {
            self.socket.write_all(&self.out).await?;
            self.out.clear();
        }
        Ok(())
    }

    fn take_frame(&mut self) -> Option<(u8, Bytes)> {
        if self.input.len() < 5 {
            return None;
        }
        let len = i32::from_be_bytes([self.input[1], self.input[2], self.input[3], self.input[4]]) as usize;
        if self.input.len() < 1 + len {
            return None;
        }
        let mut frame = self.input.split_to(1 + len).freeze();
        let tag = frame.get_u8();
        frame.advance(4);
        Some((tag, frame))
    }

    async fn next_frame(&mut self) -> io::Result<Option<(u8, Bytes)>> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
            if self.socket.read_buf(&mut self.input).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Startup-phase frame: length then body, no tag.
    async fn untagged_frame(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if self.input.len() >= 4 {
                let len = i32::from_be_bytes([self.input[0], self.input[1], self.input[2], self.input[3]]) as usize;
                if self.input.len() >= len {
                    let mut frame = self.input.split_to(len).freeze();
                    frame.advance(4);
                    return Ok(Some(frame));
                }
            }
            if self.socket.read_buf(&mut self.input).await? == 0 {
                return Ok(None);
            }
        }
    }
}

fn syntax_error(sql: &str) -> Outcome {
    let near = sql.split_whitespace().next().unwrap_or(sql);
    Outcome::Error("42601", format!("syntax error at or near \"{}\"", near))
}
