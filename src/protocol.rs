//! Wire protocol message encoding and decoding.
//!
//! Every message is `tag:u8 | length:u32_be | payload`; the length covers
//! itself but not the tag. Client messages write themselves into a
//! [`Writer`]; server messages decode from a tag plus payload [`Reader`].

use bytes::Bytes;
use uuid::Uuid;

use crate::buff::{Reader, Writer};
use crate::errors::{Error, Result};

pub const PROTOCOL_MAJOR: u16 = 1;
pub const PROTOCOL_MINOR: u16 = 0;

/// Client message tags.
pub mod client_tag {
    pub const CLIENT_HANDSHAKE: u8 = b'V';
    pub const AUTH_SASL_INITIAL: u8 = b'p';
    pub const AUTH_SASL_RESPONSE: u8 = b'r';
    pub const PREPARE: u8 = b'P';
    pub const DESCRIBE_STATEMENT: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Server message tags.
pub mod server_tag {
    pub const SERVER_HANDSHAKE: u8 = b'v';
    pub const AUTHENTICATION: u8 = b'R';
    pub const SERVER_KEY_DATA: u8 = b'K';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_COMMAND: u8 = b'Z';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const LOG_MESSAGE: u8 = b'L';
    pub const PREPARE_COMPLETE: u8 = b'1';
    pub const COMMAND_DATA_DESCRIPTION: u8 = b'T';
    pub const DATA: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
}

/// Result cardinality expectations and declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cardinality {
    NoResult = b'n',
    AtMostOne = b'o',
    One = b'A',
    Many = b'm',
    AtLeastOne = b'M',
}

impl Cardinality {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            b'n' => Cardinality::NoResult,
            b'o' => Cardinality::AtMostOne,
            b'A' => Cardinality::One,
            b'm' => Cardinality::Many,
            b'M' => Cardinality::AtLeastOne,
            other => {
                return Err(Error::protocol(format!(
                    "unknown cardinality {:#04x}",
                    other
                )))
            }
        })
    }
}

/// Result encoding requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoFormat {
    Binary = b'b',
    Json = b'j',
}

/// Transaction state carried on ReadyForCommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    NotInTransaction,
    InTransaction,
    InFailedTransaction,
}

impl TxState {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            b'I' => TxState::NotInTransaction,
            b'T' => TxState::InTransaction,
            b'E' => TxState::InFailedTransaction,
            other => {
                return Err(Error::protocol(format!(
                    "unknown transaction state {:#04x}",
                    other
                )))
            }
        })
    }
}

/// Capability bits carried in the `ALLOW_CAPABILITIES` execute header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u64);

impl Capabilities {
    pub const MODIFICATIONS: Capabilities = Capabilities(1 << 0);
    pub const SESSION_CONFIG: Capabilities = Capabilities(1 << 1);
    pub const TRANSACTION: Capabilities = Capabilities(1 << 2);
    pub const DDL: Capabilities = Capabilities(1 << 3);
    pub const ALL: Capabilities = Capabilities(u64::MAX);

    pub fn without(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 & !other.0)
    }

    pub fn allows(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Header key for the capability mask.
pub const HEADER_ALLOW_CAPABILITIES: u16 = 0xFF04;

fn write_headers(w: &mut Writer, headers: &[(u16, Vec<u8>)]) {
    w.push_u16(headers.len() as u16);
    for (key, value) in headers {
        w.push_u16(*key);
        w.push_bytes(value);
    }
}

fn read_headers(r: &mut Reader) -> Result<Vec<(u16, Bytes)>> {
    let count = r.pop_u16()? as usize;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let key = r.pop_u16()?;
        let value = r.pop_bytes()?;
        headers.push((key, value));
    }
    Ok(headers)
}

// ============================================================================
// Client messages
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientHandshake<'a> {
    pub params: &'a [(String, String)],
}

impl ClientHandshake<'_> {
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(client_tag::CLIENT_HANDSHAKE);
        w.push_u16(PROTOCOL_MAJOR);
        w.push_u16(PROTOCOL_MINOR);
        w.push_u16(self.params.len() as u16);
        for (name, value) in self.params {
            w.push_str(name);
            w.push_str(value);
        }
        w.push_u16(0); // no protocol extensions
        w.end_message()
    }
}

#[derive(Debug, Clone)]
pub struct SaslInitialResponse<'a> {
    pub method: &'a str,
    pub data: &'a [u8],
}

impl SaslInitialResponse<'_> {
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(client_tag::AUTH_SASL_INITIAL);
        w.push_str(self.method);
        w.push_bytes(self.data);
        w.end_message()
    }
}

#[derive(Debug, Clone)]
pub struct SaslResponse<'a> {
    pub data: &'a [u8],
}

impl SaslResponse<'_> {
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(client_tag::AUTH_SASL_RESPONSE);
        w.push_bytes(self.data);
        w.end_message()
    }
}

#[derive(Debug, Clone)]
pub struct Prepare<'a> {
    pub io_format: IoFormat,
    pub expected_cardinality: Cardinality,
    pub query: &'a str,
}

impl Prepare<'_> {
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(client_tag::PREPARE);
        write_headers(w, &[]);
        w.push_u8(self.io_format as u8);
        w.push_u8(self.expected_cardinality as u8);
        w.push_bytes(b""); // unnamed statement
        w.push_str(self.query);
        w.end_message()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DescribeStatement;

impl DescribeStatement {
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(client_tag::DESCRIBE_STATEMENT);
        write_headers(w, &[]);
        w.push_u8(b'T'); // data description aspect
        w.push_bytes(b""); // unnamed statement
        w.end_message()
    }
}

/// Execute carries the capability mask and the pre-encoded arguments.
#[derive(Debug, Clone)]
pub struct Execute<'a> {
    pub capabilities: Capabilities,
    pub arguments: &'a [u8],
}

impl Execute<'_> {
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(client_tag::EXECUTE);
        write_headers(
            w,
            &[(
                HEADER_ALLOW_CAPABILITIES,
                self.capabilities.0.to_be_bytes().to_vec(),
            )],
        );
        w.push_bytes(b""); // unnamed statement
        w.push_raw(self.arguments);
        w.end_message()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sync;

impl Sync {
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(client_tag::SYNC);
        w.end_message()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Terminate;

impl Terminate {
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(client_tag::TERMINATE);
        w.end_message()
    }
}

// ============================================================================
// Server messages
// ============================================================================

#[derive(Debug, Clone)]
pub enum ServerMessage {
    ServerHandshake {
        major: u16,
        minor: u16,
    },
    AuthenticationOk,
    AuthenticationSasl {
        methods: Vec<String>,
    },
    AuthenticationSaslContinue {
        data: Bytes,
    },
    AuthenticationSaslFinal {
        data: Bytes,
    },
    ServerKeyData {
        data: [u8; 32],
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    ReadyForCommand {
        tx_state: TxState,
    },
    ErrorResponse {
        severity: u8,
        code: u32,
        message: String,
        attributes: Vec<(u16, String)>,
    },
    LogMessage {
        severity: u8,
        text: String,
    },
    PrepareComplete {
        cardinality: Cardinality,
        in_type_id: Uuid,
        out_type_id: Uuid,
    },
    CommandDataDescription {
        cardinality: Cardinality,
        in_type_id: Uuid,
        in_type_blob: Bytes,
        out_type_id: Uuid,
        out_type_blob: Bytes,
    },
    Data {
        elements: Vec<Bytes>,
    },
    CommandComplete {
        status: String,
    },
}

impl ServerMessage {
    /// Decode one server message from its tag and payload.
    pub fn decode(tag: u8, payload: Bytes) -> Result<ServerMessage> {
        let mut r = Reader::new(payload);
        let msg = match tag {
            server_tag::SERVER_HANDSHAKE => {
                let major = r.pop_u16()?;
                let minor = r.pop_u16()?;
                let nextensions = r.pop_u16()? as usize;
                for _ in 0..nextensions {
                    let _name = r.pop_str()?;
                    read_headers(&mut r)?;
                }
                ServerMessage::ServerHandshake { major, minor }
            }
            server_tag::AUTHENTICATION => match r.pop_u32()? {
                0 => ServerMessage::AuthenticationOk,
                0x0A => {
                    let count = r.pop_u32()? as usize;
                    let mut methods = Vec::with_capacity(count);
                    for _ in 0..count {
                        methods.push(r.pop_str()?);
                    }
                    ServerMessage::AuthenticationSasl { methods }
                }
                0x0B => ServerMessage::AuthenticationSaslContinue {
                    data: r.pop_bytes()?,
                },
                0x0C => ServerMessage::AuthenticationSaslFinal {
                    data: r.pop_bytes()?,
                },
                other => {
                    return Err(Error::protocol(format!(
                        "unknown authentication status {:#x}",
                        other
                    )))
                }
            },
            server_tag::SERVER_KEY_DATA => {
                let mut data = [0u8; 32];
                let raw = r.slice(32)?.take_rest();
                data.copy_from_slice(&raw);
                ServerMessage::ServerKeyData { data }
            }
            server_tag::PARAMETER_STATUS => {
                let name = r.pop_str()?;
                let value = r.pop_str()?;
                ServerMessage::ParameterStatus { name, value }
            }
            server_tag::READY_FOR_COMMAND => {
                read_headers(&mut r)?;
                ServerMessage::ReadyForCommand {
                    tx_state: TxState::from_u8(r.pop_u8()?)?,
                }
            }
            server_tag::ERROR_RESPONSE => {
                let severity = r.pop_u8()?;
                let code = r.pop_u32()?;
                let message = r.pop_str()?;
                let raw_attrs = read_headers(&mut r)?;
                let attributes = raw_attrs
                    .into_iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
                    .collect();
                ServerMessage::ErrorResponse {
                    severity,
                    code,
                    message,
                    attributes,
                }
            }
            server_tag::LOG_MESSAGE => {
                let severity = r.pop_u8()?;
                let _code = r.pop_u32()?;
                let text = r.pop_str()?;
                read_headers(&mut r)?;
                ServerMessage::LogMessage { severity, text }
            }
            server_tag::PREPARE_COMPLETE => {
                read_headers(&mut r)?;
                let cardinality = Cardinality::from_u8(r.pop_u8()?)?;
                let in_type_id = r.pop_uuid()?;
                let out_type_id = r.pop_uuid()?;
                ServerMessage::PrepareComplete {
                    cardinality,
                    in_type_id,
                    out_type_id,
                }
            }
            server_tag::COMMAND_DATA_DESCRIPTION => {
                read_headers(&mut r)?;
                let cardinality = Cardinality::from_u8(r.pop_u8()?)?;
                let in_type_id = r.pop_uuid()?;
                let in_type_blob = r.pop_bytes()?;
                let out_type_id = r.pop_uuid()?;
                let out_type_blob = r.pop_bytes()?;
                ServerMessage::CommandDataDescription {
                    cardinality,
                    in_type_id,
                    in_type_blob,
                    out_type_id,
                    out_type_blob,
                }
            }
            server_tag::DATA => {
                let count = r.pop_u16()? as usize;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(r.pop_bytes()?);
                }
                ServerMessage::Data { elements }
            }
            server_tag::COMMAND_COMPLETE => {
                read_headers(&mut r)?;
                ServerMessage::CommandComplete {
                    status: r.pop_str()?,
                }
            }
            other => {
                return Err(Error::protocol(format!(
                    "unknown server message tag {:?}",
                    other as char
                )))
            }
        };
        Ok(msg)
    }

    /// Short name for unexpected-message errors.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::ServerHandshake { .. } => "ServerHandshake",
            ServerMessage::AuthenticationOk => "AuthenticationOk",
            ServerMessage::AuthenticationSasl { .. } => "AuthenticationSASL",
            ServerMessage::AuthenticationSaslContinue { .. } => "AuthenticationSASLContinue",
            ServerMessage::AuthenticationSaslFinal { .. } => "AuthenticationSASLFinal",
            ServerMessage::ServerKeyData { .. } => "ServerKeyData",
            ServerMessage::ParameterStatus { .. } => "ParameterStatus",
            ServerMessage::ReadyForCommand { .. } => "ReadyForCommand",
            ServerMessage::ErrorResponse { .. } => "ErrorResponse",
            ServerMessage::LogMessage { .. } => "LogMessage",
            ServerMessage::PrepareComplete { .. } => "PrepareComplete",
            ServerMessage::CommandDataDescription { .. } => "CommandDataDescription",
            ServerMessage::Data { .. } => "Data",
            ServerMessage::CommandComplete { .. } => "CommandComplete",
        }
    }
}
