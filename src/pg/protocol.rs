//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::types::Oid;
use crate::error::{Error, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// A message the client sends, serialized with its tag and length.
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Tagged message: tag byte, then an i32 length covering itself and the body.
fn framed(tag: u8, fill: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(tag);
    buf.put_i32(0);
    fill(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_formats(buf: &mut BytesMut, formats: &[Format]) {
    buf.put_i16(formats.len() as i16);
    for format in formats {
        buf.put_i16(*format as i16);
    }
}

/// Opens the session. Untagged: length, protocol version, then
/// name/value pairs and a closing NUL.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        let database = self.database.as_deref().map(|db| ("database", db));
        let options = self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        for (key, value) in std::iter::once(("user", self.user.as_str()))
            .chain(database)
            .chain(options)
        {
            put_cstr(&mut buf, key);
            put_cstr(&mut buf, value);
        }
        buf.put_u8(0);

        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        buf
    }
}

/// Cleartext or MD5-hashed password ('p').
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |buf| put_cstr(buf, &self.password))
    }
}

/// Simple query ('Q').
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        framed(b'Q', |buf| put_cstr(buf, &self.query))
    }
}

/// Parse ('P'): creates a statement, named or unnamed.
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'P', |buf| {
            put_cstr(buf, &self.name);
            put_cstr(buf, &self.query);
            buf.put_i16(self.param_types.len() as i16);
            for oid in &self.param_types {
                buf.put_i32(oid.as_i32());
            }
        })
    }
}

/// Bind ('B'): binds parameter payloads to a statement, creating a portal.
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    /// Encoded parameter payloads; `None` is SQL NULL
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<Format>,
}

impl FrontendMessage for BindMessage {
    fn encode(&self) -> BytesMut {
        framed(b'B', |buf| {
            put_cstr(buf, &self.portal);
            put_cstr(buf, &self.statement);
            put_formats(buf, &self.param_formats);

            buf.put_i16(self.params.len() as i16);
            for param in &self.params {
                match param {
                    Some(payload) => {
                        buf.put_i32(payload.len() as i32);
                        buf.put_slice(payload);
                    }
                    None => buf.put_i32(-1),
                }
            }

            put_formats(buf, &self.result_formats);
        })
    }
}

/// Execute ('E') a portal; `max_rows` 0 means no limit.
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        framed(b'E', |buf| {
            put_cstr(buf, &self.portal);
            buf.put_i32(self.max_rows);
        })
    }
}

/// Describe ('D') a statement (`kind` b'S') or portal (b'P').
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        framed(b'D', |buf| {
            buf.put_u8(self.kind);
            put_cstr(buf, &self.name);
        })
    }
}

/// Close ('C') a statement (`kind` b'S') or portal (b'P').
#[derive(Debug, Clone)]
pub struct CloseMessage {
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'C', |buf| {
            buf.put_u8(self.kind);
            put_cstr(buf, &self.name);
        })
    }
}

/// Sync ('S'): ends an extended-protocol exchange.
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        framed(b'S', |_| {})
    }
}

/// Terminate ('X').
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        framed(b'X', |_| {})
    }
}

/// SASLInitialResponse ('p'): mechanism name and client-first data.
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |buf| {
            put_cstr(buf, &self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(&self.data);
        })
    }
}

/// SASLResponse ('p'): later SASL data, unprefixed.
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |buf| buf.put_slice(&self.data))
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte and hold
    /// the complete message.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 5 {
            return Err(protocol_error("incomplete message header"));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();

        let body_len = usize::try_from(len)
            .ok()
            .and_then(|len| len.checked_sub(4))
            .ok_or_else(|| protocol_error(format!("invalid message length {}", len)))?;
        if buf.remaining() < body_len {
            return Err(protocol_error("incomplete message body"));
        }

        let body = buf.split_to(body_len);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Self::decode_error_response(body),
            b'N' => Self::decode_notice_response(body),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            _ => Err(protocol_error(format!(
                "unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        let auth_type = read_i32(&mut body)?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                // SASL
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(Error::Auth(format!(
                "unsupported authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        let num_fields = read_count(&mut body)?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            need(&body, 18)?;
            let table_oid = body.get_i32();
            let column_attr = body.get_i16();
            let type_oid = Oid::from_i32(body.get_i32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = if body.get_i16() == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        let num_cols = read_count(&mut body)?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = read_i32(&mut body)?;
            if len < 0 {
                values.push(None);
            } else {
                let len = len as usize;
                need(&body, len)?;
                values.push(Some(body.split_to(len)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> Result<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> Result<Self> {
        need(&body, 1)?;
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_error_response(body: Bytes) -> Result<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::ErrorResponse { fields })
    }

    fn decode_notice_response(body: Bytes) -> Result<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::NoticeResponse { fields })
    }

    fn decode_parameter_status(mut body: Bytes) -> Result<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> Result<Self> {
        let process_id = read_i32(&mut body)?;
        let secret_key = read_i32(&mut body)?;
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> Result<Self> {
        let num_params = read_count(&mut body)?;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(read_i32(&mut body)?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> Result<Self> {
        let process_id = read_i32(&mut body)?;
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// A malformed message leaves the stream in an unknown position, so the
/// connection cannot continue.
pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::ConnectionLost(format!("protocol violation: {}", msg.into()))
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(protocol_error("message body too short"));
    }
    Ok(())
}

fn read_i32(buf: &mut Bytes) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn read_count(buf: &mut Bytes) -> Result<usize> {
    need(buf, 2)?;
    usize::try_from(buf.get_i16()).map_err(|_| protocol_error("negative count"))
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| protocol_error("missing null terminator in string"))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}
