//! Scripted in-memory PostgreSQL peer for session tests.
//!
//! Speaks enough of the v3 protocol for the client: startup with optional
//! cleartext password, the extended query flow, simple queries, and Close.
//! Statements it understands:
//!
//! - `SELECT $1, $2 AS name, ...` echoes the bound payloads back, typed by
//!   the OIDs sent with Parse
//! - `SELECT <int>` returns one int4
//! - `PUT <key> <int>` / `GET <key>` against a shared store, with
//!   per-connection transactional writes
//! - `FAIL <sqlstate> <message>` raises a server error
//! - `DROP` closes the socket mid-exchange
//! - `SLEEP <ms>` stalls before answering
//! - `UNKNOWN` returns a column of a type the client has no codec for
//! - `BEGIN` / `COMMIT` / `ROLLBACK` on the simple query protocol

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::config::Config;
use crate::datasource::DataSource;
use crate::pg::connection::{BoxStream, Connector};
use crate::pg::types::Oid;

/// Type the client has no encoding for (`point`).
pub(crate) const POINT: Oid = Oid(600);

/// Counters observed by tests.
#[derive(Default)]
pub(crate) struct Stats {
    /// Sessions that completed startup
    pub connections: AtomicUsize,
    /// Named Parse messages received
    pub prepares: AtomicUsize,
    /// Terminate messages received
    pub terminates: AtomicUsize,
    /// Statement names closed by the client
    pub closed_statements: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockServer {
    password: Option<String>,
    store: Arc<Mutex<HashMap<String, i32>>>,
    stats: Arc<Stats>,
    next_pid: Arc<AtomicI32>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn connector(&self) -> Connector {
        let server = self.clone();
        Arc::new(move || {
            let server = server.clone();
            async move {
                let (client, peer) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let _ = server.serve(peer).await;
                });
                Ok(Box::new(client) as BoxStream)
            }
            .boxed()
        })
    }

    pub fn data_source(&self, config: Config) -> DataSource {
        DataSource::with_connector(config, self.connector()).unwrap()
    }

    async fn serve(self, mut stream: DuplexStream) -> io::Result<()> {
        let mut session = Session {
            server: self,
            out: BytesMut::new(),
            statements: HashMap::new(),
            portal: None,
            in_tx: false,
            failed: false,
            pending: HashMap::new(),
            skipping: false,
        };
        if !session.startup(&mut stream).await? {
            return Ok(());
        }

        loop {
            let Some((tag, body)) = read_message(&mut stream).await? else {
                return Ok(());
            };
            match session.handle(tag, body).await {
                Step::Continue => {}
                Step::Flush => {
                    let out = std::mem::take(&mut session.out);
                    stream.write_all(&out).await?;
                    stream.flush().await?;
                }
                Step::Hangup => return Ok(()),
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

struct Prepared {
    query: String,
    types: Vec<Oid>,
}

struct Portal {
    query: String,
    types: Vec<Oid>,
    params: Vec<Option<Bytes>>,
}

enum Step {
    Continue,
    Flush,
    Hangup,
}

enum Outcome {
    Rows {
        rows: Vec<Vec<Option<Bytes>>>,
        tag: String,
    },
    Error {
        code: String,
        message: String,
    },
    Hangup,
}

struct Session {
    server: MockServer,
    out: BytesMut,
    statements: HashMap<String, Prepared>,
    portal: Option<Portal>,
    in_tx: bool,
    failed: bool,
    pending: HashMap<String, i32>,
    /// After an error, extended-protocol messages are ignored until Sync.
    skipping: bool,
}

impl Session {
    async fn startup(&mut self, stream: &mut DuplexStream) -> io::Result<bool> {
        let len = stream.read_i32().await?;
        let mut body = vec![0u8; (len - 4) as usize];
        stream.read_exact(&mut body).await?;

        if let Some(expected) = self.server.password.clone() {
            put_message(&mut self.out, b'R', |b| b.put_i32(3));
            flush(stream, &mut self.out).await?;

            let Some((b'p', mut reply)) = read_message(stream).await? else {
                return Ok(false);
            };
            if read_cstr(&mut reply) != expected {
                self.error("28P01", "password authentication failed for user");
                flush(stream, &mut self.out).await?;
                return Ok(false);
            }
        }

        let pid = self.server.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;
        put_message(&mut self.out, b'R', |b| b.put_i32(0));
        put_message(&mut self.out, b'S', |b| {
            put_cstr(b, "server_version");
            put_cstr(b, "16.0");
        });
        put_message(&mut self.out, b'K', |b| {
            b.put_i32(pid);
            b.put_i32(42);
        });
        self.ready();
        flush(stream, &mut self.out).await?;
        self.server.stats.connections.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn handle(&mut self, tag: u8, mut body: Bytes) -> Step {
        match tag {
            b'S' => {
                self.skipping = false;
                self.ready();
                return Step::Flush;
            }
            b'H' => return Step::Flush,
            b'X' => {
                self.server.stats.terminates.fetch_add(1, Ordering::SeqCst);
                return Step::Hangup;
            }
            b'Q' => {
                let query = read_cstr(&mut body);
                return self.simple_query(&query);
            }
            _ if self.skipping => return Step::Continue,
            _ => {}
        }

        match tag {
            b'P' => {
                let name = read_cstr(&mut body);
                let query = read_cstr(&mut body);
                let count = body.get_i16();
                let types = (0..count).map(|_| Oid(body.get_i32())).collect();
                if !name.is_empty() {
                    self.server.stats.prepares.fetch_add(1, Ordering::SeqCst);
                }
                self.statements.insert(name, Prepared { query, types });
                put_message(&mut self.out, b'1', |_| {});
            }
            b'B' => {
                let _portal = read_cstr(&mut body);
                let name = read_cstr(&mut body);
                let formats = body.get_i16();
                body.advance(formats as usize * 2);
                let count = body.get_i16();
                let params: Vec<Option<Bytes>> = (0..count)
                    .map(|_| match body.get_i32() {
                        -1 => None,
                        len => Some(body.split_to(len as usize)),
                    })
                    .collect();

                let Some(stmt) = self.statements.get(&name) else {
                    self.error("26000", &format!("prepared statement \"{}\" does not exist", name));
                    return Step::Continue;
                };
                let expected = param_count(&stmt.query);
                if params.len() != expected {
                    let message = format!(
                        "bind message supplies {} parameters, \
                         but prepared statement \"{}\" requires {}",
                        params.len(),
                        name,
                        expected
                    );
                    self.error("08P01", &message);
                    return Step::Continue;
                }
                self.portal = Some(Portal {
                    query: stmt.query.clone(),
                    types: stmt.types.clone(),
                    params,
                });
                put_message(&mut self.out, b'2', |_| {});
            }
            b'D' => {
                let kind = body.get_u8();
                let name = read_cstr(&mut body);
                let (query, types) = if kind == b'S' {
                    match self.statements.get(&name) {
                        Some(stmt) => (stmt.query.clone(), stmt.types.clone()),
                        None => {
                            self.error("26000", "prepared statement does not exist");
                            return Step::Continue;
                        }
                    }
                } else {
                    match &self.portal {
                        Some(portal) => (portal.query.clone(), portal.types.clone()),
                        None => {
                            self.error("34000", "portal does not exist");
                            return Step::Continue;
                        }
                    }
                };

                if kind == b'S' {
                    let count = param_count(&query);
                    put_message(&mut self.out, b't', |b| {
                        b.put_i16(count as i16);
                        for i in 0..count {
                            b.put_i32(param_type(&types, i).as_i32());
                        }
                    });
                }
                let columns = describe(&query, &types);
                if columns.is_empty() {
                    put_message(&mut self.out, b'n', |_| {});
                } else {
                    put_message(&mut self.out, b'T', |b| {
                        b.put_i16(columns.len() as i16);
                        for (name, oid) in &columns {
                            put_cstr(b, name);
                            b.put_i32(0);
                            b.put_i16(0);
                            b.put_i32(oid.as_i32());
                            b.put_i16(-1);
                            b.put_i32(-1);
                            b.put_i16(1);
                        }
                    });
                }
            }
            b'E' => {
                let Some(portal) = self.portal.take() else {
                    self.error("34000", "portal does not exist");
                    return Step::Continue;
                };
                match self.run(&portal.query, &portal.params).await {
                    Outcome::Rows { rows, tag } => {
                        for row in rows {
                            put_data_row(&mut self.out, &row);
                        }
                        put_message(&mut self.out, b'C', |b| put_cstr(b, &tag));
                    }
                    Outcome::Error { code, message } => self.fail(&code, &message),
                    Outcome::Hangup => return Step::Hangup,
                }
            }
            b'C' => {
                let kind = body.get_u8();
                let name = read_cstr(&mut body);
                if kind == b'S' {
                    self.statements.remove(&name);
                    self.server.stats.closed_statements.lock().push(name);
                }
                put_message(&mut self.out, b'3', |_| {});
            }
            _ => {
                self.error("08P01", &format!("unexpected message {}", tag as char));
            }
        }
        Step::Continue
    }

    fn simple_query(&mut self, query: &str) -> Step {
        match query.trim() {
            "BEGIN" => {
                self.in_tx = true;
                put_message(&mut self.out, b'C', |b| put_cstr(b, "BEGIN"));
            }
            "COMMIT" => {
                let tag = if self.failed { "ROLLBACK" } else { "COMMIT" };
                if !self.failed {
                    let writes = std::mem::take(&mut self.pending);
                    self.server.store.lock().extend(writes);
                }
                self.end_transaction();
                put_message(&mut self.out, b'C', |b| put_cstr(b, tag));
            }
            "ROLLBACK" => {
                self.end_transaction();
                put_message(&mut self.out, b'C', |b| put_cstr(b, "ROLLBACK"));
            }
            other => self.error("0A000", &format!("unsupported simple query: {}", other)),
        }
        self.skipping = false;
        self.ready();
        Step::Flush
    }

    async fn run(&mut self, query: &str, params: &[Option<Bytes>]) -> Outcome {
        if self.failed {
            return Outcome::Error {
                code: "25P02".to_string(),
                message: "current transaction is aborted".to_string(),
            };
        }

        let words: Vec<&str> = query.split_whitespace().collect();
        match words.as_slice() {
            ["SELECT", first, ..] if first.starts_with('$') => Outcome::Rows {
                rows: vec![echo_columns(query)
                    .iter()
                    .map(|(n, _)| params.get(n - 1).cloned().flatten())
                    .collect()],
                tag: "SELECT 1".to_string(),
            },
            ["SELECT", n] => match n.parse::<i32>() {
                Ok(n) => single_int(n),
                Err(_) => syntax_error(query),
            },
            ["PUT", key, value] => match value.parse::<i32>() {
                Ok(value) => {
                    if self.in_tx {
                        self.pending.insert(key.to_string(), value);
                    } else {
                        self.server.store.lock().insert(key.to_string(), value);
                    }
                    Outcome::Rows {
                        rows: vec![],
                        tag: "INSERT 0 1".to_string(),
                    }
                }
                Err(_) => syntax_error(query),
            },
            ["GET", key] => {
                let value = self
                    .pending
                    .get(*key)
                    .copied()
                    .or_else(|| self.server.store.lock().get(*key).copied());
                let rows: Vec<Vec<Option<Bytes>>> = value
                    .into_iter()
                    .map(|v| vec![Some(Bytes::copy_from_slice(&v.to_be_bytes()))])
                    .collect();
                let tag = format!("SELECT {}", rows.len());
                Outcome::Rows { rows, tag }
            }
            ["FAIL", code, message @ ..] => Outcome::Error {
                code: code.to_string(),
                message: message.join(" "),
            },
            ["DROP"] => Outcome::Hangup,
            ["SLEEP", ms] => {
                let ms = ms.parse::<u64>().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                single_int(1)
            }
            ["UNKNOWN"] => Outcome::Rows {
                rows: vec![vec![Some(Bytes::from(vec![0u8; 16]))]],
                tag: "SELECT 1".to_string(),
            },
            [] => Outcome::Rows {
                rows: vec![],
                tag: String::new(),
            },
            _ => syntax_error(query),
        }
    }

    fn end_transaction(&mut self) {
        self.in_tx = false;
        self.failed = false;
        self.pending.clear();
    }

    /// Error during execution: aborts an open transaction.
    fn fail(&mut self, code: &str, message: &str) {
        if self.in_tx {
            self.failed = true;
        }
        self.error(code, message);
    }

    fn error(&mut self, code: &str, message: &str) {
        self.skipping = true;
        put_message(&mut self.out, b'E', |b| {
            b.put_u8(b'S');
            put_cstr(b, "ERROR");
            b.put_u8(b'C');
            put_cstr(b, code);
            b.put_u8(b'M');
            put_cstr(b, message);
            b.put_u8(b'P');
            put_cstr(b, "1");
            b.put_u8(0);
        });
    }

    fn ready(&mut self) {
        let status = match (self.in_tx, self.failed) {
            (false, _) => b'I',
            (true, false) => b'T',
            (true, true) => b'E',
        };
        put_message(&mut self.out, b'Z', |b| b.put_u8(status));
    }
}

// ============================================================================
// Statement shapes
// ============================================================================

/// Highest `$n` in the statement.
fn param_count(query: &str) -> usize {
    query
        .split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Unspecified parameter types resolve to text.
fn param_type(types: &[Oid], index: usize) -> Oid {
    match types.get(index) {
        Some(oid) if *oid != Oid::UNSPECIFIED => *oid,
        _ => Oid::TEXT,
    }
}

/// `(ordinal, column name)` for each item of an echo select list.
fn echo_columns(query: &str) -> Vec<(usize, String)> {
    let list = query.trim_start_matches("SELECT").trim();
    list.split(',')
        .filter_map(|item| {
            let mut words = item.split_whitespace();
            let n = words.next()?.strip_prefix('$')?.parse::<usize>().ok()?;
            let name = match (words.next(), words.next()) {
                (Some("AS"), Some(alias)) => alias.to_string(),
                _ => "?column?".to_string(),
            };
            Some((n, name))
        })
        .collect()
}

fn describe(query: &str, types: &[Oid]) -> Vec<(String, Oid)> {
    let words: Vec<&str> = query.split_whitespace().collect();
    match words.as_slice() {
        ["SELECT", first, ..] if first.starts_with('$') => echo_columns(query)
            .into_iter()
            .map(|(n, name)| (name, param_type(types, n - 1)))
            .collect(),
        ["SELECT", _] | ["SLEEP", _] => vec![("?column?".to_string(), Oid::INT4)],
        ["GET", _] => vec![("value".to_string(), Oid::INT4)],
        ["UNKNOWN"] => vec![("location".to_string(), POINT)],
        _ => vec![],
    }
}

fn single_int(n: i32) -> Outcome {
    Outcome::Rows {
        rows: vec![vec![Some(Bytes::copy_from_slice(&n.to_be_bytes()))]],
        tag: "SELECT 1".to_string(),
    }
}

fn syntax_error(query: &str) -> Outcome {
    Outcome::Error {
        code: "42601".to_string(),
        message: format!("syntax error at or near \"{}\"", query),
    }
}

// ============================================================================
// Framing
// ============================================================================

async fn read_message(stream: &mut DuplexStream) -> io::Result<Option<(u8, Bytes)>> {
    let tag = match stream.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = stream.read_i32().await?;
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some((tag, Bytes::from(body))))
}

async fn flush(stream: &mut DuplexStream, out: &mut BytesMut) -> io::Result<()> {
    let bytes = std::mem::take(out);
    stream.write_all(&bytes).await?;
    stream.flush().await
}

fn put_message(out: &mut BytesMut, tag: u8, fill: impl FnOnce(&mut BytesMut)) {
    let mut body = BytesMut::new();
    fill(&mut body);
    out.put_u8(tag);
    out.put_i32(body.len() as i32 + 4);
    out.put_slice(&body);
}

fn put_data_row(out: &mut BytesMut, values: &[Option<Bytes>]) {
    put_message(out, b'D', |b| {
        b.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(bytes) => {
                    b.put_i32(bytes.len() as i32);
                    b.put_slice(bytes);
                }
                None => b.put_i32(-1),
            }
        }
    });
}

fn put_cstr(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn read_cstr(buf: &mut Bytes) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance((end + 1).min(buf.len()));
    s
}
