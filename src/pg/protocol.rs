//! PostgreSQL v3 wire protocol messages.
//!
//! Only the subset the pool needs: startup and authentication, TLS
//! negotiation, and the extended query protocol.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::{Oid, Value};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic version number of the SSLRequest packet.
pub const SSL_REQUEST_CODE: i32 = 80877103; // (1234 << 16) | 5679

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status reported in ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Encodes a frontend message into its wire form.
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Frame a tagged message: tag byte, then a length that counts itself.
fn tagged(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

/// Frame an untagged message (startup and SSL negotiation).
fn untagged(body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_i32(0);
    body(&mut buf);
    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Asks the server to upgrade the socket to TLS before startup.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest;

impl FrontendMessage for SslRequest {
    fn encode(&self) -> BytesMut {
        untagged(|buf| buf.put_i32(SSL_REQUEST_CODE))
    }
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: String,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        untagged(|buf| {
            buf.put_i32(PROTOCOL_VERSION);
            put_cstr(buf, "user");
            put_cstr(buf, &self.user);
            put_cstr(buf, "database");
            put_cstr(buf, &self.database);
            for (key, value) in &self.options {
                put_cstr(buf, key);
                put_cstr(buf, value);
            }
            buf.put_u8(0);
        })
    }
}

/// Password message (cleartext or MD5 auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| put_cstr(buf, &self.password))
    }
}

/// First SCRAM message, naming the mechanism.
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| {
            put_cstr(buf, &self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(&self.data);
        })
    }
}

/// Subsequent SCRAM messages.
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| buf.put_slice(&self.data))
    }
}

/// Parse ('P'): create a prepared statement. An empty name is the unnamed statement.
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'P', |buf| {
            put_cstr(buf, self.name);
            put_cstr(buf, self.query);
            buf.put_i16(self.param_types.len() as i16);
            for oid in &self.param_types {
                buf.put_i32(oid.as_i32());
            }
        })
    }
}

/// Bind ('B'): bind parameters to a statement, requesting text results.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [Value],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'B', |buf| {
            put_cstr(buf, self.portal);
            put_cstr(buf, self.statement);

            buf.put_i16(self.params.len() as i16);
            for param in self.params {
                buf.put_i16(param.format() as i16);
            }

            buf.put_i16(self.params.len() as i16);
            for param in self.params {
                match param.encode() {
                    Some(bytes) => {
                        buf.put_i32(bytes.len() as i32);
                        buf.put_slice(&bytes);
                    }
                    None => buf.put_i32(-1),
                }
            }

            // One result format code applies to every column.
            buf.put_i16(1);
            buf.put_i16(Format::Text as i16);
        })
    }
}

/// Describe ('D'): `b'S'` for a statement, `b'P'` for a portal.
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'D', |buf| {
            buf.put_u8(self.kind);
            put_cstr(buf, self.name);
        })
    }
}

/// Execute ('E'): run a bound portal. `max_rows == 0` means no limit.
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'E', |buf| {
            put_cstr(buf, self.portal);
            buf.put_i32(self.max_rows);
        })
    }
}

/// Sync ('S'): end of an extended-query cycle.
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'S', |_| {})
    }
}

/// Terminate ('X'): polite goodbye before closing the socket.
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'X', |_| {})
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
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    NotificationResponse { process_id: i32, channel: String, payload: String },
}

impl BackendMessage {
    /// Decode one backend message. The buffer must start with the type byte
    /// and hold the complete message.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 || buf.remaining() < (len - 4) as usize {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let mut body = Reader(buf.split_to((len - 4) as usize));

        match msg_type {
            b'R' => body.auth(),
            b'T' => body.row_description(),
            b'D' => body.data_row(),
            b'C' => Ok(BackendMessage::CommandComplete { tag: body.cstring()? }),
            b'Z' => Ok(BackendMessage::ReadyForQuery {
                status: TransactionStatus::from(body.u8()?),
            }),
            b'E' => Ok(BackendMessage::ErrorResponse { fields: body.fields()? }),
            b'N' => Ok(BackendMessage::NoticeResponse { fields: body.fields()? }),
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: body.cstring()?,
                value: body.cstring()?,
            }),
            b'K' => Ok(BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            }),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => body.parameter_description(),
            b'A' => Ok(BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstring()?,
                payload: body.cstring()?,
            }),
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }
}

/// Bounds-checked cursor over a message body.
struct Reader(Bytes);

impl Reader {
    fn need(&self, n: usize) -> PgResult<()> {
        if self.0.remaining() < n {
            return Err(PgError::Protocol("Truncated message".to_string()));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.0.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.0.get_i32())
    }

    fn bytes(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.0.split_to(n))
    }

    fn cstring(&mut self) -> PgResult<String> {
        let end = self
            .0
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

        let s = String::from_utf8_lossy(&self.0[..end]).into_owned();
        self.0.advance(end + 1);
        Ok(s)
    }

    fn auth(&mut self) -> PgResult<BackendMessage> {
        match self.i32()? {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&self.bytes(4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while self.0.has_remaining() {
                    let mech = self.cstring()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue {
                data: std::mem::take(&mut self.0),
            }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal {
                data: std::mem::take(&mut self.0),
            }),
            other => Err(PgError::Protocol(format!(
                "Unsupported authentication type: {}",
                other
            ))),
        }
    }

    fn row_description(&mut self) -> PgResult<BackendMessage> {
        let count = self.i16()?.max(0) as usize;
        let mut fields = Vec::with_capacity(count);

        for _ in 0..count {
            fields.push(FieldDescription {
                name: self.cstring()?,
                table_oid: self.i32()?,
                column_attr: self.i16()?,
                type_oid: Oid::from_i32(self.i32()?),
                type_size: self.i16()?,
                type_modifier: self.i32()?,
                format: if self.i16()? == 0 {
                    Format::Text
                } else {
                    Format::Binary
                },
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn data_row(&mut self) -> PgResult<BackendMessage> {
        let count = self.i16()?.max(0) as usize;
        let mut values = Vec::with_capacity(count);

        for _ in 0..count {
            let len = self.i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(self.bytes(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn parameter_description(&mut self) -> PgResult<BackendMessage> {
        let count = self.i16()?.max(0) as usize;
        let mut type_oids = Vec::with_capacity(count);
        for _ in 0..count {
            type_oids.push(Oid::from_i32(self.i32()?));
        }
        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    /// Error/notice fields: (code byte, cstring)* terminated by a zero byte.
    fn fields(&mut self) -> PgResult<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        while self.0.has_remaining() {
            let code = self.u8()?;
            if code == 0 {
                break;
            }
            fields.insert(code, self.cstring()?);
        }
        Ok(fields)
    }
}
