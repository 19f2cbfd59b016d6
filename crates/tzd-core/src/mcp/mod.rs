//! Monitor control protocol (MCP).
//!
//! MCP messages are exchanged through the 256-byte MCP buffer of the
//! [mailbox](crate::mailbox). A command starts with its id word; the secure
//! monitor overwrites the buffer with a response whose id word carries
//! [`FLAG_RESPONSE`] followed by a result word and, on success, a
//! command-specific payload. Either side announces a new message by queueing
//! a notification for [`SID_MCP`](crate::SID_MCP).
//!
//! ```text
//! command:  | id | params ...            |
//! response: | id | FLAG_RESPONSE | result | payload ... |
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{MonitorVersion, SessionId};

/// Size of the MCP buffer in 32-bit words.
pub const MCP_BUFFER_WORDS: usize = 64;

/// Size of the MCP buffer in bytes.
pub const MCP_BUFFER_SIZE: usize = MCP_BUFFER_WORDS * 4;

/// Bit set on the id word of every response.
pub const FLAG_RESPONSE: u32 = 1 << 31;

/// MCP codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum McpError {
    /// The buffer ended before the message did.
    #[error("MCP {message} truncated: needs {expected} bytes, got {actual}")]
    Truncated {
        /// Message being decoded.
        message: &'static str,
        /// Required size.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The id word names no known command.
    #[error("unknown MCP command id {0:#x}")]
    UnknownCommand(u32),

    /// A response was expected but the id word lacks [`FLAG_RESPONSE`].
    #[error("MCP id word {0:#x} is not a response")]
    NotAResponse(u32),
}

/// Result type for MCP decoding.
pub type McpCodecResult<T> = Result<T, McpError>;

/// MCP command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum McpCommandId {
    /// Load a trustlet and open a session.
    OpenSession = 1,
    /// Close a session.
    CloseSession = 3,
    /// Map a normal-world buffer into a session.
    Map = 4,
    /// Unmap a buffer from a session.
    Unmap = 5,
    /// Suspend the secure world.
    Suspend = 6,
    /// Resume the secure world.
    Resume = 7,
    /// Hand normal-world memory to the secure world.
    DonateRam = 8,
    /// Query the monitor version block.
    GetMobicoreVersion = 9,
}

impl McpCommandId {
    /// Parses a raw id word with [`FLAG_RESPONSE`] masked off.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::UnknownCommand`] for unknown ids.
    pub const fn from_u32(raw: u32) -> McpCodecResult<Self> {
        Ok(match raw & !FLAG_RESPONSE {
            1 => Self::OpenSession,
            3 => Self::CloseSession,
            4 => Self::Map,
            5 => Self::Unmap,
            6 => Self::Suspend,
            7 => Self::Resume,
            8 => Self::DonateRam,
            9 => Self::GetMobicoreVersion,
            _ => return Err(McpError::UnknownCommand(raw)),
        })
    }

    /// Returns the raw command id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for McpCommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenSession => "OPEN_SESSION",
            Self::CloseSession => "CLOSE_SESSION",
            Self::Map => "MAP",
            Self::Unmap => "UNMAP",
            Self::Suspend => "SUSPEND",
            Self::Resume => "RESUME",
            Self::DonateRam => "DONATE_RAM",
            Self::GetMobicoreVersion => "GET_MOBICORE_VERSION",
        };
        f.write_str(name)
    }
}

/// Result word of an MCP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McpResult {
    /// Success.
    Ok,
    /// The session id is unknown to the monitor.
    InvalidSession,
    /// No trustlet with the requested UUID.
    UnknownUuid,
    /// Session limit reached.
    NoMoreSessions,
    /// The trustlet image was refused.
    TrustletInvalid,
    /// The buffer is already mapped.
    AlreadyMapped,
    /// A parameter was rejected.
    InvalidParam,
    /// The secure world is out of memory.
    OutOfResources,
    /// The world-shared memory reference is invalid.
    InvalidWsm,
    /// Unspecified failure.
    Unknown,
    /// The command id is unknown to the monitor.
    UnknownCommand,
    /// A result word outside the known set.
    Other(u32),
}

impl McpResult {
    /// Parses a raw result word.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::InvalidSession,
            2 => Self::UnknownUuid,
            4 => Self::NoMoreSessions,
            6 => Self::TrustletInvalid,
            7 => Self::AlreadyMapped,
            8 => Self::InvalidParam,
            9 => Self::OutOfResources,
            10 => Self::InvalidWsm,
            11 => Self::Unknown,
            50 => Self::UnknownCommand,
            other => Self::Other(other),
        }
    }

    /// Returns the raw result word.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::InvalidSession => 1,
            Self::UnknownUuid => 2,
            Self::NoMoreSessions => 4,
            Self::TrustletInvalid => 6,
            Self::AlreadyMapped => 7,
            Self::InvalidParam => 8,
            Self::OutOfResources => 9,
            Self::InvalidWsm => 10,
            Self::Unknown => 11,
            Self::UnknownCommand => 50,
            Self::Other(raw) => raw,
        }
    }

    /// Returns `true` for [`McpResult::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for McpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "result {raw}"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// Reference to a world-shared buffer inside an MCP command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsmRef {
    /// Physical address of the buffer.
    pub phys_addr: u64,
    /// Offset of the payload inside the first page.
    pub offset: u32,
    /// Payload length.
    pub len: u32,
}

impl WsmRef {
    const SIZE: usize = 16;

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.phys_addr);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.len);
    }

    fn read_from(buf: &mut Bytes) -> Self {
        Self {
            phys_addr: buf.get_u64_le(),
            offset: buf.get_u32_le(),
            len: buf.get_u32_le(),
        }
    }
}

/// Location of a trustlet image handed to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadImage {
    /// Physical address of the image registration.
    pub phys_addr: u64,
    /// Image length.
    pub len: u32,
    /// Length of the image header the monitor inspects first.
    pub header_len: u32,
}

/// A command sent to the secure monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpCommand {
    /// Load a trustlet and open a session with it.
    OpenSession {
        /// Trustlet identity.
        uuid: Uuid,
        /// Trustlet control interface buffer.
        tci: WsmRef,
        /// Trustlet image.
        image: LoadImage,
    },
    /// Close a session.
    CloseSession {
        /// Session to close.
        session_id: SessionId,
    },
    /// Map a registered buffer into a session.
    Map {
        /// Target session.
        session_id: SessionId,
        /// Buffer page table and payload range.
        buffer: WsmRef,
    },
    /// Unmap a buffer from a session.
    Unmap {
        /// Target session.
        session_id: SessionId,
        /// Address returned by the matching `Map`.
        secure_virtual_addr: u32,
        /// Payload length.
        len: u32,
    },
    /// Suspend the secure world.
    Suspend,
    /// Resume the secure world.
    Resume,
    /// Donate normal-world memory.
    DonateRam {
        /// Physical address of the donated region.
        phys_addr: u64,
        /// Region length.
        len: u32,
    },
    /// Query the monitor version block.
    GetMobicoreVersion,
}

impl McpCommand {
    /// Returns the command id.
    #[must_use]
    pub const fn id(&self) -> McpCommandId {
        match self {
            Self::OpenSession { .. } => McpCommandId::OpenSession,
            Self::CloseSession { .. } => McpCommandId::CloseSession,
            Self::Map { .. } => McpCommandId::Map,
            Self::Unmap { .. } => McpCommandId::Unmap,
            Self::Suspend => McpCommandId::Suspend,
            Self::Resume => McpCommandId::Resume,
            Self::DonateRam { .. } => McpCommandId::DonateRam,
            Self::GetMobicoreVersion => McpCommandId::GetMobicoreVersion,
        }
    }

    /// Encodes the command for the MCP buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MCP_BUFFER_SIZE);
        buf.put_u32_le(self.id().as_u32());
        match self {
            Self::OpenSession { uuid, tci, image } => {
                buf.put_slice(uuid.as_bytes());
                tci.write_to(&mut buf);
                buf.put_u64_le(image.phys_addr);
                buf.put_u32_le(image.len);
                buf.put_u32_le(image.header_len);
            },
            Self::CloseSession { session_id } => buf.put_u32_le(session_id.as_u32()),
            Self::Map { session_id, buffer } => {
                buf.put_u32_le(session_id.as_u32());
                buffer.write_to(&mut buf);
            },
            Self::Unmap {
                session_id,
                secure_virtual_addr,
                len,
            } => {
                buf.put_u32_le(session_id.as_u32());
                buf.put_u32_le(*secure_virtual_addr);
                buf.put_u32_le(*len);
            },
            Self::DonateRam { phys_addr, len } => {
                buf.put_u64_le(*phys_addr);
                buf.put_u32_le(*len);
            },
            Self::Suspend | Self::Resume | Self::GetMobicoreVersion => {},
        }
        buf.freeze()
    }

    /// Decodes a command from the MCP buffer.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown ids or truncated parameters.
    pub fn decode(bytes: &[u8]) -> McpCodecResult<Self> {
        let mut buf = Bytes::copy_from_slice(bytes);
        ensure(&buf, 4, "command")?;
        let id = McpCommandId::from_u32(buf.get_u32_le())?;
        let command = match id {
            McpCommandId::OpenSession => {
                ensure(&buf, 16 + WsmRef::SIZE + 16, "OPEN_SESSION")?;
                let mut uuid = [0u8; 16];
                buf.copy_to_slice(&mut uuid);
                let tci = WsmRef::read_from(&mut buf);
                let image = LoadImage {
                    phys_addr: buf.get_u64_le(),
                    len: buf.get_u32_le(),
                    header_len: buf.get_u32_le(),
                };
                Self::OpenSession {
                    uuid: Uuid::from_bytes(uuid),
                    tci,
                    image,
                }
            },
            McpCommandId::CloseSession => {
                ensure(&buf, 4, "CLOSE_SESSION")?;
                Self::CloseSession {
                    session_id: SessionId::new(buf.get_u32_le()),
                }
            },
            McpCommandId::Map => {
                ensure(&buf, 4 + WsmRef::SIZE, "MAP")?;
                Self::Map {
                    session_id: SessionId::new(buf.get_u32_le()),
                    buffer: WsmRef::read_from(&mut buf),
                }
            },
            McpCommandId::Unmap => {
                ensure(&buf, 12, "UNMAP")?;
                Self::Unmap {
                    session_id: SessionId::new(buf.get_u32_le()),
                    secure_virtual_addr: buf.get_u32_le(),
                    len: buf.get_u32_le(),
                }
            },
            McpCommandId::DonateRam => {
                ensure(&buf, 12, "DONATE_RAM")?;
                Self::DonateRam {
                    phys_addr: buf.get_u64_le(),
                    len: buf.get_u32_le(),
                }
            },
            McpCommandId::Suspend => Self::Suspend,
            McpCommandId::Resume => Self::Resume,
            McpCommandId::GetMobicoreVersion => Self::GetMobicoreVersion,
        };
        Ok(command)
    }
}

/// Command-specific data of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpPayload {
    /// Commands answered with a bare result word.
    None,
    /// `OPEN_SESSION`: the new session id.
    OpenSession {
        /// Monitor-assigned session id.
        session_id: SessionId,
    },
    /// `MAP`: the buffer's address in the trustlet.
    Map {
        /// Secure virtual address.
        secure_virtual_addr: u32,
    },
    /// `GET_MOBICORE_VERSION`: the version block.
    Version(MonitorVersion),
}

/// A response read back from the MCP buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpResponse {
    /// Command this response answers.
    pub id: McpCommandId,
    /// Result word.
    pub result: McpResult,
    /// Payload; [`McpPayload::None`] unless `result` is OK.
    pub payload: McpPayload,
}

impl McpResponse {
    /// Creates a response with a bare result word.
    #[must_use]
    pub const fn new(id: McpCommandId, result: McpResult) -> Self {
        Self {
            id,
            result,
            payload: McpPayload::None,
        }
    }

    /// Creates a successful response carrying `payload`.
    #[must_use]
    pub const fn ok(id: McpCommandId, payload: McpPayload) -> Self {
        Self {
            id,
            result: McpResult::Ok,
            payload,
        }
    }

    /// Encodes the response for the MCP buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MCP_BUFFER_SIZE);
        buf.put_u32_le(self.id.as_u32() | FLAG_RESPONSE);
        buf.put_u32_le(self.result.as_u32());
        match &self.payload {
            McpPayload::None => {},
            McpPayload::OpenSession { session_id } => buf.put_u32_le(session_id.as_u32()),
            McpPayload::Map {
                secure_virtual_addr,
            } => buf.put_u32_le(*secure_virtual_addr),
            McpPayload::Version(version) => version.write_to(&mut buf),
        }
        buf.freeze()
    }

    /// Decodes a response from the MCP buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the id word lacks [`FLAG_RESPONSE`], names an
    /// unknown command, or the payload is truncated.
    pub fn decode(bytes: &[u8]) -> McpCodecResult<Self> {
        let mut buf = Bytes::copy_from_slice(bytes);
        ensure(&buf, 8, "response")?;
        let raw_id = buf.get_u32_le();
        if raw_id & FLAG_RESPONSE == 0 {
            return Err(McpError::NotAResponse(raw_id));
        }
        let id = McpCommandId::from_u32(raw_id)?;
        let result = McpResult::from_u32(buf.get_u32_le());
        if !result.is_ok() {
            return Ok(Self::new(id, result));
        }
        let payload = match id {
            McpCommandId::OpenSession => {
                ensure(&buf, 4, "OPEN_SESSION response")?;
                McpPayload::OpenSession {
                    session_id: SessionId::new(buf.get_u32_le()),
                }
            },
            McpCommandId::Map => {
                ensure(&buf, 4, "MAP response")?;
                McpPayload::Map {
                    secure_virtual_addr: buf.get_u32_le(),
                }
            },
            McpCommandId::GetMobicoreVersion => {
                ensure(&buf, MonitorVersion::ENCODED_LEN, "version response")?;
                McpPayload::Version(MonitorVersion::read_from(&mut buf))
            },
            _ => McpPayload::None,
        };
        Ok(Self::ok(id, payload))
    }
}

fn ensure(buf: &Bytes, needed: usize, message: &'static str) -> McpCodecResult<()> {
    if buf.remaining() < needed {
        return Err(McpError::Truncated {
            message,
            expected: needed,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_fit_the_buffer() {
        let command = McpCommand::OpenSession {
            uuid: Uuid::from_bytes([7; 16]),
            tci: WsmRef {
                phys_addr: u64::MAX,
                offset: 0,
                len: 4096,
            },
            image: LoadImage {
                phys_addr: 0x8000_0000,
                len: 1024,
                header_len: 128,
            },
        };
        let encoded = command.encode();
        assert!(encoded.len() <= MCP_BUFFER_SIZE);
        assert_eq!(McpCommand::decode(&encoded).unwrap(), command);
    }

    #[test]
    fn decode_tolerates_buffer_padding() {
        let mut buffer = vec![0u8; MCP_BUFFER_SIZE];
        let encoded = McpCommand::CloseSession {
            session_id: SessionId::new(4),
        }
        .encode();
        buffer[..encoded.len()].copy_from_slice(&encoded);
        assert_eq!(
            McpCommand::decode(&buffer).unwrap(),
            McpCommand::CloseSession {
                session_id: SessionId::new(4)
            }
        );
    }

    #[test]
    fn response_sets_flag() {
        let response = McpResponse::ok(
            McpCommandId::Map,
            McpPayload::Map {
                secure_virtual_addr: 0x0010_0000,
            },
        );
        let encoded = response.encode();
        let id_word = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(id_word, McpCommandId::Map.as_u32() | FLAG_RESPONSE);
        assert_eq!(McpResponse::decode(&encoded).unwrap(), response);
    }

    #[test]
    fn command_is_not_a_response() {
        let encoded = McpCommand::Suspend.encode();
        let mut buffer = encoded.to_vec();
        buffer.extend_from_slice(&[0; 4]);
        assert_eq!(
            McpResponse::decode(&buffer),
            Err(McpError::NotAResponse(McpCommandId::Suspend.as_u32()))
        );
    }

    #[test]
    fn failed_response_has_no_payload() {
        let encoded = McpResponse::new(McpCommandId::OpenSession, McpResult::UnknownUuid).encode();
        let decoded = McpResponse::decode(&encoded).unwrap();
        assert_eq!(decoded.result, McpResult::UnknownUuid);
        assert_eq!(decoded.payload, McpPayload::None);
    }

    #[test]
    fn unknown_result_is_preserved() {
        assert_eq!(McpResult::from_u32(77), McpResult::Other(77));
        assert_eq!(McpResult::Other(77).as_u32(), 77);
        assert_eq!(McpResult::from_u32(50), McpResult::UnknownCommand);
    }

    #[test]
    fn unknown_command_id() {
        assert_eq!(
            McpCommand::decode(&2u32.to_le_bytes()),
            Err(McpError::UnknownCommand(2))
        );
    }
}
