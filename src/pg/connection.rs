//! PostgreSQL connection implementation.
//!
//! This module provides the session type that handles:
//! - Connection establishment over any byte stream
//! - Startup and authentication
//! - Text and prepared statements on the extended protocol
//! - Per-connection prepared statement caching

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::encoding::registry;
use super::protocol::*;
use super::scram::ScramClient;
use super::statement::{CachedStatement, StatementCache};
use super::types::Oid;
use crate::config::Config;
use crate::error::{Error, Result, ServerError};
use crate::row::{Column, Columns, Row};
use crate::statement::{PreparedStatement, Statement};

// ============================================================================
// Transport
// ============================================================================

/// Byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Opens a fresh transport for the pool.
pub type Connector = Arc<dyn Fn() -> BoxFuture<'static, io::Result<BoxStream>> + Send + Sync>;

/// Connector dialing `config.host:config.port` over TCP.
pub fn tcp_connector(config: &Config) -> Connector {
    let addr = format!("{}:{}", config.host, config.port);
    Arc::new(move || {
        let addr = addr.clone();
        async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxStream)
        }
        .boxed()
    })
}

// ============================================================================
// Connection State
// ============================================================================

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready for the next operation
    Idle,
    /// Writing a request
    Sending,
    /// Request flushed, waiting for the server
    AwaitingResponse,
    /// Turning DataRows into rows
    Decoding,
    /// Unusable; must be destroyed
    Broken,
}

// ============================================================================
// Query Result
// ============================================================================

/// Result of one statement execution.
#[derive(Debug)]
pub struct QueryResult {
    /// Column descriptions shared by all rows
    pub columns: Columns,
    /// Decoded rows
    pub rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    /// Affected-row count from the command tag.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL session.
pub struct PgConnection {
    reader: BufReader<ReadHalf<BoxStream>>,
    writer: BufWriter<WriteHalf<BoxStream>>,
    /// Connection configuration
    config: Config,
    /// Prepared statement cache
    statement_cache: StatementCache,
    /// Evicted statements still to be closed on the server
    pending_close: Vec<String>,
    /// Server-side transaction status from the last ReadyForQuery
    transaction_status: TransactionStatus,
    /// Backend process ID
    backend_pid: i32,
    /// Backend secret key (for cancellation)
    backend_secret_key: i32,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    state: ConnectionState,
    /// Read buffer for incoming messages
    read_buffer: BytesMut,
}

impl PgConnection {
    /// Connect to `config.host:config.port` over TCP.
    pub async fn connect(config: &Config) -> Result<Self> {
        let stream = tcp_connector(config)().await?;
        Self::connect_stream(stream, config).await
    }

    /// Run the startup handshake over an already-open stream.
    pub async fn connect_stream(stream: BoxStream, config: &Config) -> Result<Self> {
        let (read_half, write_half) = tokio::io::split(stream);

        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            statement_cache: StatementCache::new(config.statement_cache_capacity),
            config: config.clone(),
            pending_close: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            backend_secret_key: 0,
            parameters: HashMap::new(),
            state: ConnectionState::Sending,
            read_buffer: BytesMut::with_capacity(32768), // 32KB buffer for better throughput
        };

        conn.startup().await?;
        conn.state = ConnectionState::Idle;

        debug!(
            host = %conn.config.host,
            port = conn.config.port,
            backend_pid = conn.backend_pid,
            "connection established"
        );
        Ok(conn)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self) -> Result<()> {
        let mut options = Vec::new();
        if let Some(name) = &self.config.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }
        let startup = StartupMessage {
            user: self.config.user.clone(),
            database: self.config.database.clone(),
            options,
        };

        self.send_message(&startup).await?;

        loop {
            let msg = self.receive_message().await?;

            match msg {
                BackendMessage::AuthenticationOk => {
                    // Authentication successful, continue to ReadyForQuery
                }
                BackendMessage::AuthenticationCleartextPassword => {
                    debug!(method = "cleartext", "authenticating");
                    let password = self.password()?;
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    debug!(method = "md5", "authenticating");
                    let password = self.password()?;
                    let hash = md5_password(&self.config.user, &password, &salt);
                    self.send_message(&PasswordMessage { password: hash })
                        .await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(Error::Auth(format!(
                            "server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    debug!(method = "scram-sha-256", "authenticating");
                    self.authenticate_scram().await?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
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
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(startup_error(&fields));
                }
                _ => {
                    // Ignore other messages during startup
                }
            }
        }
    }

    async fn authenticate_scram(&mut self) -> Result<()> {
        let password = self.password()?;
        let mut scram = ScramClient::new(&self.config.user, &password);

        let sasl_initial = SaslInitialResponseMessage {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: scram.client_first_message(),
        };
        self.send_message(&sasl_initial).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client_final = scram
                        .process_server_first(&data)
                        .map_err(|e| Error::Auth(e.to_string()))?;
                    self.send_message(&SaslResponseMessage { data: client_final })
                        .await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    return scram
                        .verify_server_final(&data)
                        .map_err(|e| Error::Auth(e.to_string()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(startup_error(&fields));
                }
                _ => {
                    // Continue waiting for SASL messages
                }
            }
        }
    }

    fn password(&self) -> Result<String> {
        self.config
            .password
            .clone()
            .ok_or_else(|| Error::Auth("password required".to_string()))
    }

    // ========================================================================
    // Statement execution
    // ========================================================================

    /// Run a statement and collect its rows.
    pub async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        Ok(self.run(statement).await?.rows)
    }

    /// Run a statement and report the affected-row count.
    pub async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        Ok(self.run(statement).await?.rows_affected())
    }

    /// Run a statement and keep the full result.
    pub async fn run(&mut self, statement: &Statement) -> Result<QueryResult> {
        self.ensure_idle()?;

        // Local failures (unbound ordinals, unencodable values) happen before
        // anything is written, so the connection stays Idle.
        let result = match statement {
            Statement::Text(sql) => self.run_text(sql).await,
            Statement::Prepared(stmt) => {
                let (types, params) = encode_params(stmt)?;
                self.run_prepared(stmt.query(), types, params).await
            }
        };

        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// Text statement: Parse + Bind + Describe + Execute + Sync on the
    /// unnamed statement, so results come back in binary.
    async fn run_text(&mut self, sql: &str) -> Result<QueryResult> {
        self.state = ConnectionState::Sending;
        self.buffer_pending_closes().await?;

        self.buffer_message(&ParseMessage {
            name: String::new(),
            query: sql.to_string(),
            param_types: vec![],
        })
        .await?;
        self.buffer_message(&BindMessage {
            portal: String::new(),
            statement: String::new(),
            param_formats: vec![],
            params: vec![],
            result_formats: vec![Format::Binary],
        })
        .await?;
        self.buffer_message(&DescribeMessage {
            kind: b'P',
            name: String::new(),
        })
        .await?;
        self.buffer_message(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        self.state = ConnectionState::AwaitingResponse;
        self.read_results(None).await
    }

    async fn run_prepared(
        &mut self,
        query: &str,
        types: Vec<Oid>,
        params: Vec<Option<Bytes>>,
    ) -> Result<QueryResult> {
        let stmt = match self.statement_cache.get(query, &types) {
            Some(cached) => {
                trace!(statement = %cached.name, "statement cache hit");
                cached
            }
            None => self.prepare(query, types).await?,
        };

        if stmt.param_types.len() > params.len() {
            return Err(Error::UnboundParameter(params.len()));
        }

        self.state = ConnectionState::Sending;
        self.buffer_pending_closes().await?;

        let bind = BindMessage {
            portal: String::new(),
            statement: stmt.name.clone(),
            param_formats: vec![Format::Binary; params.len()],
            params,
            result_formats: vec![Format::Binary],
        };
        self.buffer_message(&bind).await?;
        self.buffer_message(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0, // No limit
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        self.state = ConnectionState::AwaitingResponse;
        self.read_results(Some(Arc::clone(&stmt.columns))).await
    }

    /// Parse + Describe a named statement and cache it under `(query, types)`.
    async fn prepare(&mut self, query: &str, types: Vec<Oid>) -> Result<Arc<CachedStatement>> {
        self.state = ConnectionState::Sending;
        self.buffer_pending_closes().await?;

        let name = self.statement_cache.next_statement_name();
        self.buffer_message(&ParseMessage {
            name: name.clone(),
            query: query.to_string(),
            param_types: types.clone(),
        })
        .await?;
        self.buffer_message(&DescribeMessage {
            kind: b'S',
            name: name.clone(),
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;
        self.state = ConnectionState::AwaitingResponse;

        let mut stmt = CachedStatement::new(name, query.to_string());
        stmt.param_types = types.clone();
        let mut first_error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::ParameterDescription { type_oids } => {
                    stmt.param_types = type_oids;
                }
                BackendMessage::RowDescription { fields } => {
                    stmt.columns = columns_from(fields);
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = server_error(&fields);
                    first_error.get_or_insert(err);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    if let Some(err) = first_error {
                        return Err(err);
                    }

                    trace!(statement = %stmt.name, query, "prepared statement");
                    let stmt = Arc::new(stmt);
                    if let Some(evicted) = self.statement_cache.insert(types, Arc::clone(&stmt)) {
                        debug!(statement = %evicted, "evicted prepared statement");
                        self.pending_close.push(evicted);
                    }
                    return Ok(stmt);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                _ => {
                    // ParseComplete, NoData, CloseComplete, notices
                }
            }
        }
    }

    /// Read one exchange up to ReadyForQuery.
    ///
    /// The first failure (server or decode) is kept and returned once the
    /// exchange is drained, leaving the connection Idle.
    async fn read_results(&mut self, columns: Option<Columns>) -> Result<QueryResult> {
        let mut result = QueryResult {
            columns: columns.unwrap_or_default(),
            rows: Vec::new(),
            command_tag: String::new(),
        };
        let mut first_error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    result.columns = columns_from(fields);
                }
                BackendMessage::DataRow { values } => {
                    if first_error.is_some() {
                        continue;
                    }
                    self.state = ConnectionState::Decoding;
                    match decode_row(&result.columns, &values) {
                        Ok(row) => result.rows.push(row),
                        Err(err) => {
                            debug!(error = %err, "row decode failed");
                            first_error = Some(err);
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    result.command_tag = tag;
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = server_error(&fields);
                    first_error.get_or_insert(err);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return match first_error {
                        Some(err) => Err(err),
                        None => Ok(result),
                    };
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::NoticeResponse { fields } => {
                    trace!(message = ?fields.get(&b'M'), "server notice");
                }
                _ => {
                    // ParseComplete, BindComplete, CloseComplete, NoData
                }
            }
        }
    }

    /// Run a command on the simple query protocol, ignoring any rows.
    ///
    /// Used for BEGIN/COMMIT/ROLLBACK.
    pub async fn simple_command(&mut self, sql: &str) -> Result<()> {
        self.ensure_idle()?;
        let result = self.simple_command_inner(sql).await;
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    async fn simple_command_inner(&mut self, sql: &str) -> Result<()> {
        self.state = ConnectionState::Sending;
        self.send_message(&QueryMessage {
            query: sql.to_string(),
        })
        .await?;
        self.state = ConnectionState::AwaitingResponse;

        let mut first_error = None;
        loop {
            match self.receive_message().await? {
                BackendMessage::ErrorResponse { fields } => {
                    let err = server_error(&fields);
                    first_error.get_or_insert(err);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return first_error.map_or(Ok(()), Err);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                _ => {}
            }
        }
    }

    /// Execute BEGIN using the simple query protocol.
    pub async fn begin(&mut self) -> Result<()> {
        self.simple_command("BEGIN").await
    }

    /// Execute COMMIT using the simple query protocol.
    pub async fn commit(&mut self) -> Result<()> {
        self.simple_command("COMMIT").await
    }

    /// Execute ROLLBACK using the simple query protocol.
    pub async fn rollback(&mut self) -> Result<()> {
        self.simple_command("ROLLBACK").await
    }

    /// Send Terminate. The connection is unusable afterwards.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Broken {
            return Ok(());
        }
        self.state = ConnectionState::Broken;
        self.send_message(&TerminateMessage).await
    }

    /// Get a reference to the statement cache.
    pub fn statement_cache(&self) -> &StatementCache {
        &self.statement_cache
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the connection can no longer be used.
    pub fn is_broken(&self) -> bool {
        self.state == ConnectionState::Broken
    }

    /// Idle on both ends: no exchange in flight and no open transaction.
    pub fn is_reusable(&self) -> bool {
        self.state == ConnectionState::Idle && self.transaction_status == TransactionStatus::Idle
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Get backend process ID.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Get backend secret key.
    pub fn backend_secret_key(&self) -> i32 {
        self.backend_secret_key
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// An operation may only start on an Idle connection. Anything else
    /// means an earlier exchange was abandoned mid-flight.
    fn ensure_idle(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Idle => Ok(()),
            ConnectionState::Broken => Err(Error::ConnectionLost(
                "connection is broken".to_string(),
            )),
            state => {
                warn!(
                    ?state,
                    backend_pid = self.backend_pid,
                    "connection reused mid-exchange"
                );
                self.state = ConnectionState::Broken;
                Err(Error::ConnectionLost(format!(
                    "previous operation abandoned while {:?}",
                    state
                )))
            }
        }
    }

    fn fail(&mut self, err: &Error) {
        if err.is_connection_lost() && self.state != ConnectionState::Broken {
            warn!(backend_pid = self.backend_pid, error = %err, "connection broken");
            self.state = ConnectionState::Broken;
        }
    }

    fn ready(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
        self.state = ConnectionState::Idle;
    }

    async fn buffer_pending_closes(&mut self) -> Result<()> {
        for name in std::mem::take(&mut self.pending_close) {
            trace!(statement = %name, "closing evicted statement");
            self.buffer_message(&CloseMessage { kind: b'S', name }).await?;
        }
        Ok(())
    }

    /// Send a frontend message (with flush).
    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> Result<()> {
        let encoded = msg.encode();
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Buffer a frontend message without flushing (for pipelining).
    #[inline]
    async fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> Result<()> {
        let encoded = msg.encode();
        self.writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Flush buffered messages.
    #[inline]
    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive a backend message.
    async fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            // Try to decode from buffer first
            if self.read_buffer.len() >= 5 {
                let length = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]);
                if length < 4 {
                    return Err(protocol_error(format!("invalid message length {}", length)));
                }

                let total_len = 1 + length as usize; // type byte + length field value

                if self.read_buffer.len() >= total_len {
                    let msg_bytes = self.read_buffer.split_to(total_len);
                    return BackendMessage::decode(&mut msg_bytes.freeze());
                }
            }

            // Need more data
            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(Error::ConnectionLost(
                    "server closed the connection".to_string(),
                ));
            }
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Encode the bindings of a prepared statement through the registry.
fn encode_params(stmt: &PreparedStatement) -> Result<(Vec<Oid>, Vec<Option<Bytes>>)> {
    let values = stmt.params()?;
    let registry = registry();
    let mut types = Vec::with_capacity(values.len());
    let mut params = Vec::with_capacity(values.len());
    for value in values {
        let (oid, payload) = registry.encode(value)?;
        types.push(oid);
        params.push(payload);
    }
    Ok((types, params))
}

fn columns_from(fields: Vec<FieldDescription>) -> Columns {
    Arc::new(
        fields
            .into_iter()
            .map(|field| Column::new(field.name, field.type_oid))
            .collect(),
    )
}

fn decode_row(columns: &Columns, values: &[Option<Bytes>]) -> Result<Row> {
    if values.len() != columns.len() {
        return Err(Error::InvalidValue(format!(
            "row has {} values for {} columns",
            values.len(),
            columns.len()
        )));
    }

    let registry = registry();
    let decoded = columns
        .iter()
        .zip(values)
        .map(|(column, value)| registry.decode(column.oid(), value.as_deref()))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(Arc::clone(columns), decoded))
}

/// Parse the affected-row count out of a CommandComplete tag.
///
/// Tags look like "INSERT 0 5", "UPDATE 3", "SELECT 10".
pub fn parse_rows_affected(tag: &str) -> u64 {
    let mut parts = tag.split_whitespace();
    match parts.next() {
        Some("INSERT" | "UPDATE" | "DELETE" | "SELECT" | "MERGE" | "MOVE" | "FETCH" | "COPY") => {
            parts.last().and_then(|n| n.parse().ok()).unwrap_or(0)
        }
        _ => 0,
    }
}

/// Compute MD5 password hash.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    // Convert inner hash to hex string, then append salt bytes
    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.as_bytes().to_vec();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}

/// Build a ServerError from error response fields, verbatim.
fn server_error(fields: &HashMap<u8, String>) -> Error {
    let err = ServerError {
        severity: fields.get(&b'S').cloned().unwrap_or_default(),
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
        position: fields.get(&b'P').and_then(|p| p.parse().ok()),
    };
    debug!(code = %err.code, message = %err.message, "server error");
    Error::Server(err)
}

/// Errors during startup in SQLSTATE class 28 reject the credentials.
fn startup_error(fields: &HashMap<u8, String>) -> Error {
    match fields.get(&b'C') {
        Some(code) if code.starts_with("28") => {
            Error::Auth(fields.get(&b'M').cloned().unwrap_or_default())
        }
        _ => server_error(fields),
    }
}
