//! Startup and session-level backend messages.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{
    MessageBuilder, expect_end, read_bytes, read_cstr, read_i32, read_u8, read_u32,
};
use crate::protocol::types::{TransactionStatus, U32BE};

use super::msg_type;

/// Authentication method constants.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const KERBEROS_V5: i32 = 2;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const GSS: i32 = 7;
    pub const GSS_CONTINUE: i32 = 8;
    pub const SSPI: i32 = 9;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Authentication message from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMessage<'a> {
    /// Authentication successful
    Ok,
    /// Kerberos V5 authentication required
    KerberosV5,
    /// Cleartext password required
    CleartextPassword,
    /// MD5 password required (with 4-byte salt)
    Md5Password { salt: [u8; 4] },
    /// GSS authentication
    Gss,
    /// GSS continue (with additional data)
    GssContinue { data: &'a [u8] },
    /// SSPI authentication
    Sspi,
    /// SASL authentication required (with list of mechanisms)
    Sasl { mechanisms: Vec<&'a str> },
    /// SASL continue (with server-first-message)
    SaslContinue { data: &'a [u8] },
    /// SASL final (with server-final-message)
    SaslFinal { data: &'a [u8] },
}

impl<'a> AuthenticationMessage<'a> {
    /// Parse an Authentication message from payload bytes.
    ///
    /// An unknown request code yields [`Error::UnsupportedAuthMethod`].
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (code, rest) = read_i32(payload)?;

        let message = match code {
            auth_type::OK => AuthenticationMessage::Ok,
            auth_type::KERBEROS_V5 => AuthenticationMessage::KerberosV5,
            auth_type::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
            auth_type::MD5_PASSWORD => {
                let (salt, rest) = read_bytes(rest, 4)
                    .map_err(|_| Error::Protocol("MD5Password: missing salt".into()))?;
                expect_end(rest, "MD5Password")?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(salt);
                return Ok(AuthenticationMessage::Md5Password { salt: buf });
            }
            auth_type::GSS => AuthenticationMessage::Gss,
            auth_type::GSS_CONTINUE => return Ok(AuthenticationMessage::GssContinue { data: rest }),
            auth_type::SSPI => AuthenticationMessage::Sspi,
            auth_type::SASL => {
                let mut mechanisms = Vec::new();
                let mut data = rest;
                loop {
                    let (mechanism, remaining) = read_cstr(data)?;
                    data = remaining;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                expect_end(data, "AuthenticationSASL")?;
                return Ok(AuthenticationMessage::Sasl { mechanisms });
            }
            auth_type::SASL_CONTINUE => {
                return Ok(AuthenticationMessage::SaslContinue { data: rest });
            }
            auth_type::SASL_FINAL => return Ok(AuthenticationMessage::SaslFinal { data: rest }),
            _ => {
                return Err(Error::UnsupportedAuthMethod(format!(
                    "authentication request code {code}"
                )));
            }
        };
        expect_end(rest, "Authentication")?;
        Ok(message)
    }

    /// Human-readable method name, used in error messages.
    pub fn method_name(&self) -> &'static str {
        match self {
            AuthenticationMessage::Ok => "ok",
            AuthenticationMessage::KerberosV5 => "Kerberos V5",
            AuthenticationMessage::CleartextPassword => "cleartext password",
            AuthenticationMessage::Md5Password { .. } => "MD5 password",
            AuthenticationMessage::Gss | AuthenticationMessage::GssContinue { .. } => "GSSAPI",
            AuthenticationMessage::Sspi => "SSPI",
            AuthenticationMessage::Sasl { .. }
            | AuthenticationMessage::SaslContinue { .. }
            | AuthenticationMessage::SaslFinal { .. } => "SASL",
        }
    }

    /// Write a framed Authentication message.
    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::AUTHENTICATION);
        match self {
            AuthenticationMessage::Ok => msg.write_i32(auth_type::OK),
            AuthenticationMessage::KerberosV5 => msg.write_i32(auth_type::KERBEROS_V5),
            AuthenticationMessage::CleartextPassword => {
                msg.write_i32(auth_type::CLEARTEXT_PASSWORD)
            }
            AuthenticationMessage::Md5Password { salt } => {
                msg.write_i32(auth_type::MD5_PASSWORD);
                msg.write_bytes(salt);
            }
            AuthenticationMessage::Gss => msg.write_i32(auth_type::GSS),
            AuthenticationMessage::GssContinue { data } => {
                msg.write_i32(auth_type::GSS_CONTINUE);
                msg.write_bytes(data);
            }
            AuthenticationMessage::Sspi => msg.write_i32(auth_type::SSPI),
            AuthenticationMessage::Sasl { mechanisms } => {
                msg.write_i32(auth_type::SASL);
                for mechanism in mechanisms {
                    msg.write_cstr(mechanism);
                }
                msg.write_u8(0);
            }
            AuthenticationMessage::SaslContinue { data } => {
                msg.write_i32(auth_type::SASL_CONTINUE);
                msg.write_bytes(data);
            }
            AuthenticationMessage::SaslFinal { data } => {
                msg.write_i32(auth_type::SASL_FINAL);
                msg.write_bytes(data);
            }
        }
        msg.finish();
    }
}

/// BackendKeyData message - contains process ID and secret key for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct BackendKeyData {
    /// Process ID of the backend
    pub pid: U32BE,
    /// Secret key for cancellation
    pub secret_key: U32BE,
}

impl BackendKeyData {
    pub fn new(pid: u32, secret_key: u32) -> Self {
        Self {
            pid: U32BE::new(pid),
            secret_key: U32BE::new(secret_key),
        }
    }

    /// Parse a BackendKeyData message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Self::read_from_bytes(payload).map_err(|_| {
            Error::Protocol(format!(
                "BackendKeyData: expected 8 bytes, got {}",
                payload.len()
            ))
        })
    }

    /// Get the process ID.
    pub fn process_id(&self) -> u32 {
        self.pid.get()
    }

    /// Get the secret key.
    pub fn secret(&self) -> u32 {
        self.secret_key.get()
    }

    /// Write a framed BackendKeyData message.
    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::BACKEND_KEY_DATA);
        msg.write_bytes(self.as_bytes());
        msg.finish();
    }
}

/// ParameterStatus message - server parameter name and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus<'a> {
    /// Parameter name
    pub name: &'a str,
    /// Parameter value
    pub value: &'a str,
}

impl<'a> ParameterStatus<'a> {
    /// Parse a ParameterStatus message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (name, rest) = read_cstr(payload)?;
        let (value, rest) = read_cstr(rest)?;
        expect_end(rest, "ParameterStatus")?;
        Ok(Self { name, value })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::PARAMETER_STATUS);
        msg.write_cstr(self.name);
        msg.write_cstr(self.value);
        msg.finish();
    }
}

/// ReadyForQuery message - indicates server is ready for a new query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyForQuery {
    /// Transaction status reported by the server
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    /// Parse a ReadyForQuery message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (byte, rest) = read_u8(payload)?;
        expect_end(rest, "ReadyForQuery")?;
        Ok(Self {
            status: TransactionStatus::from_byte(byte)?,
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::READY_FOR_QUERY);
        msg.write_u8(self.status.to_byte().unwrap_or(b'I'));
        msg.finish();
    }
}

/// NotificationResponse message - asynchronous notification from LISTEN/NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationResponse<'a> {
    /// PID of the notifying backend
    pub pid: u32,
    /// Channel name
    pub channel: &'a str,
    /// Notification payload
    pub payload: &'a str,
}

impl<'a> NotificationResponse<'a> {
    /// Parse a NotificationResponse message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (pid, rest) = read_u32(payload)?;
        let (channel, rest) = read_cstr(rest)?;
        let (payload_str, rest) = read_cstr(rest)?;
        expect_end(rest, "NotificationResponse")?;
        Ok(Self {
            pid,
            channel,
            payload: payload_str,
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::NOTIFICATION_RESPONSE);
        msg.write_i32(self.pid as i32);
        msg.write_cstr(self.channel);
        msg.write_cstr(self.payload);
        msg.finish();
    }
}

/// NegotiateProtocolVersion message - server doesn't support requested protocol features.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateProtocolVersion<'a> {
    /// Newest minor protocol version supported
    pub newest_minor_version: u32,
    /// Unrecognized protocol options
    pub unrecognized_options: Vec<&'a str>,
}

impl<'a> NegotiateProtocolVersion<'a> {
    /// Parse a NegotiateProtocolVersion message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (newest_minor_version, rest) = read_u32(payload)?;
        let (num_options, mut rest) = read_u32(rest)?;

        let mut unrecognized_options = Vec::new();
        for _ in 0..num_options {
            let (option, remaining) = read_cstr(rest)?;
            unrecognized_options.push(option);
            rest = remaining;
        }
        expect_end(rest, "NegotiateProtocolVersion")?;

        Ok(Self {
            newest_minor_version,
            unrecognized_options,
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::NEGOTIATE_PROTOCOL_VERSION);
        msg.write_i32(self.newest_minor_version as i32);
        msg.write_i32(self.unrecognized_options.len() as i32);
        for option in &self.unrecognized_options {
            msg.write_cstr(option);
        }
        msg.finish();
    }
}
