//! Client wire protocol.
//!
//! Clients talk to the daemon with fixed-layout little-endian messages. Every
//! request starts with a 4-byte [`CommandHeader`] followed by a payload whose
//! size is fixed per command; every reply (except to `NOTIFY`) starts with a
//! 4-byte [`ResponseHeader`], followed by a payload only when the response
//! code is [`ResponseCode::Ok`].
//!
//! ```text
//! +------------+----------------------+
//! | command_id | payload (fixed size) |
//! |  u32 (LE)  |                      |
//! +------------+----------------------+
//! ```
//!
//! Notification connections receive a stream of 8-byte [`Notification`]
//! records once `NQ_CONNECT` has succeeded.
//!
//! # Invariants
//!
//! - Decoders never read past [`WireMessage::SIZE`] bytes
//! - Unknown command ids are rejected, never defaulted

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{DeviceId, MonitorVersion, Notification, SessionId, WsmHandle};

/// Size of the command and response headers.
pub const HEADER_SIZE: usize = 4;

/// Wire protocol errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the message layout requires.
    #[error("{message} needs {expected} bytes, got {actual}")]
    Truncated {
        /// Message being decoded.
        message: &'static str,
        /// Required size.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The command id is not part of the protocol.
    #[error("unknown command id {0}")]
    UnknownCommand(u32),

    /// The response code is not part of the protocol.
    #[error("unknown response code {0}")]
    UnknownResponse(u32),
}

/// Result type for wire decoding.
pub type WireResult<T> = Result<T, WireError>;

/// Commands a client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandId {
    /// Liveness check; answered with `OK` and no payload.
    Ping = 0,
    /// Reserved; always refused.
    GetInfo = 1,
    /// Bind this connection to a device.
    OpenDevice = 2,
    /// Release the device bound to this connection.
    CloseDevice = 3,
    /// Turn this connection into a session's notification channel.
    NqConnect = 4,
    /// Load and open a trustlet session.
    OpenSession = 5,
    /// Close a trustlet session.
    CloseSession = 6,
    /// Signal a trustlet. Has no response.
    Notify = 7,
    /// Map a client buffer into a trustlet.
    MapBulkBuf = 8,
    /// Unmap a client buffer from a trustlet.
    UnmapBulkBuf = 9,
    /// Query the daemon protocol version.
    GetVersion = 10,
    /// Query the secure monitor version block.
    GetMobicoreVersion = 11,
}

impl CommandId {
    /// Parses a raw command id.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownCommand`] for ids outside the protocol.
    pub const fn from_u32(raw: u32) -> WireResult<Self> {
        Ok(match raw {
            0 => Self::Ping,
            1 => Self::GetInfo,
            2 => Self::OpenDevice,
            3 => Self::CloseDevice,
            4 => Self::NqConnect,
            5 => Self::OpenSession,
            6 => Self::CloseSession,
            7 => Self::Notify,
            8 => Self::MapBulkBuf,
            9 => Self::UnmapBulkBuf,
            10 => Self::GetVersion,
            11 => Self::GetMobicoreVersion,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }

    /// Returns the raw command id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Returns `false` for commands the daemon never answers.
    #[must_use]
    pub const fn has_response(self) -> bool {
        !matches!(self, Self::Notify)
    }

    /// Returns the command name as used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::GetInfo => "GET_INFO",
            Self::OpenDevice => "OPEN_DEVICE",
            Self::CloseDevice => "CLOSE_DEVICE",
            Self::NqConnect => "NQ_CONNECT",
            Self::OpenSession => "OPEN_SESSION",
            Self::CloseSession => "CLOSE_SESSION",
            Self::Notify => "NOTIFY",
            Self::MapBulkBuf => "MAP_BULK_BUF",
            Self::UnmapBulkBuf => "UNMAP_BULK_BUF",
            Self::GetVersion => "GET_VERSION",
            Self::GetMobicoreVersion => "GET_MOBICORE_VERSION",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response codes returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResponseCode {
    /// Success.
    Ok = 0,
    /// Unspecified failure.
    Failed = 1,
    /// The command needs an opened device.
    DeviceNotOpened = 2,
    /// The connection already has a device.
    DeviceAlreadyOpened = 3,
    /// The command is not allowed in the connection's state.
    CommandNotAllowed = 4,
    /// No device with the requested id.
    InvalidDeviceName = 5,
    /// Mapping a bulk buffer failed.
    MapBulkError = 6,
    /// The trustlet image could not be found or was refused.
    TrustletNotFound = 7,
    /// Payload length does not match the command.
    PayloadLengthError = 8,
    /// No such session for this client.
    UnknownSession = 9,
    /// The secure world ran out of resources.
    OutOfResources = 10,
    /// A request field is invalid.
    InvalidParameter = 11,
    /// The world-shared memory handle is unknown.
    WsmNotFound = 12,
    /// The secure monitor is unreachable.
    DaemonUnreachable = 13,
}

impl ResponseCode {
    /// Parses a raw response code.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownResponse`] for codes outside the protocol.
    pub const fn from_u32(raw: u32) -> WireResult<Self> {
        Ok(match raw {
            0 => Self::Ok,
            1 => Self::Failed,
            2 => Self::DeviceNotOpened,
            3 => Self::DeviceAlreadyOpened,
            4 => Self::CommandNotAllowed,
            5 => Self::InvalidDeviceName,
            6 => Self::MapBulkError,
            7 => Self::TrustletNotFound,
            8 => Self::PayloadLengthError,
            9 => Self::UnknownSession,
            10 => Self::OutOfResources,
            11 => Self::InvalidParameter,
            12 => Self::WsmNotFound,
            13 => Self::DaemonUnreachable,
            other => return Err(WireError::UnknownResponse(other)),
        })
    }

    /// Returns the raw response code.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Returns `true` for [`ResponseCode::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.as_u32())
    }
}

/// A fixed-size message of the client protocol.
pub trait WireMessage: Sized {
    /// Message name used in errors.
    const NAME: &'static str;

    /// Exact encoded size in bytes.
    const SIZE: usize;

    /// Appends the encoded message to `buf`.
    fn encode_into(&self, buf: &mut BytesMut);

    /// Reads the message; at least [`Self::SIZE`] bytes are available.
    fn decode_from(buf: &mut Bytes) -> Self;

    /// Encodes the message into a fresh buffer.
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes the message from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] if fewer than [`Self::SIZE`] bytes
    /// are given.
    fn decode(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(WireError::Truncated {
                message: Self::NAME,
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let mut buf = Bytes::copy_from_slice(&bytes[..Self::SIZE]);
        Ok(Self::decode_from(&mut buf))
    }
}

/// Header preceding every client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Raw command id; see [`CommandId::from_u32`].
    pub command_id: u32,
}

impl CommandHeader {
    /// Creates a header for `command`.
    #[must_use]
    pub const fn new(command: CommandId) -> Self {
        Self {
            command_id: command.as_u32(),
        }
    }

    /// Parses the command id.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownCommand`] for ids outside the protocol.
    pub const fn command(&self) -> WireResult<CommandId> {
        CommandId::from_u32(self.command_id)
    }
}

impl WireMessage for CommandHeader {
    const NAME: &'static str = "command header";
    const SIZE: usize = HEADER_SIZE;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.command_id);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            command_id: buf.get_u32_le(),
        }
    }
}

/// Header preceding every daemon response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Raw response code; see [`ResponseCode::from_u32`].
    pub response_code: u32,
}

impl ResponseHeader {
    /// Creates a header for `code`.
    #[must_use]
    pub const fn new(code: ResponseCode) -> Self {
        Self {
            response_code: code.as_u32(),
        }
    }

    /// Parses the response code.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownResponse`] for codes outside the protocol.
    pub const fn code(&self) -> WireResult<ResponseCode> {
        ResponseCode::from_u32(self.response_code)
    }
}

impl WireMessage for ResponseHeader {
    const NAME: &'static str = "response header";
    const SIZE: usize = HEADER_SIZE;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.response_code);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            response_code: buf.get_u32_le(),
        }
    }
}

/// `OPEN_DEVICE` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenDeviceRequest {
    /// Device to bind.
    pub device_id: DeviceId,
}

impl WireMessage for OpenDeviceRequest {
    const NAME: &'static str = "OPEN_DEVICE request";
    const SIZE: usize = 4;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.device_id.as_u32());
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            device_id: DeviceId::new(buf.get_u32_le()),
        }
    }
}

/// `OPEN_SESSION` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSessionRequest {
    /// Device the session is opened on.
    pub device_id: DeviceId,
    /// Trustlet to load.
    pub uuid: Uuid,
    /// Handle of the client's trustlet control interface buffer.
    pub tci_handle: WsmHandle,
    /// Bytes of the TCI buffer shared with the trustlet.
    pub tci_len: u32,
}

impl WireMessage for OpenSessionRequest {
    const NAME: &'static str = "OPEN_SESSION request";
    const SIZE: usize = 4 + 16 + 4 + 4;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.device_id.as_u32());
        buf.put_slice(self.uuid.as_bytes());
        buf.put_u32_le(self.tci_handle.as_u32());
        buf.put_u32_le(self.tci_len);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        let device_id = DeviceId::new(buf.get_u32_le());
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        Self {
            device_id,
            uuid: Uuid::from_bytes(uuid),
            tci_handle: WsmHandle::new(buf.get_u32_le()),
            tci_len: buf.get_u32_le(),
        }
    }
}

/// `OPEN_SESSION` response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSessionResponse {
    /// Session id assigned by the secure monitor.
    pub session_id: SessionId,
    /// Daemon-assigned session number.
    pub device_session_id: u32,
    /// Random value the client must echo in `NQ_CONNECT`.
    pub session_magic: u32,
}

impl WireMessage for OpenSessionResponse {
    const NAME: &'static str = "OPEN_SESSION response";
    const SIZE: usize = 12;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.session_id.as_u32());
        buf.put_u32_le(self.device_session_id);
        buf.put_u32_le(self.session_magic);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            session_id: SessionId::new(buf.get_u32_le()),
            device_session_id: buf.get_u32_le(),
            session_magic: buf.get_u32_le(),
        }
    }
}

/// Request naming a single session (`CLOSE_SESSION`, `NOTIFY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    /// Target session.
    pub session_id: SessionId,
}

impl WireMessage for SessionRequest {
    const NAME: &'static str = "session request";
    const SIZE: usize = 4;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.session_id.as_u32());
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            session_id: SessionId::new(buf.get_u32_le()),
        }
    }
}

/// `NQ_CONNECT` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NqConnectRequest {
    /// Device the session lives on.
    pub device_id: DeviceId,
    /// Daemon-assigned session number from `OPEN_SESSION`.
    pub device_session_id: u32,
    /// Monitor-assigned session id.
    pub session_id: SessionId,
    /// Magic from `OPEN_SESSION`.
    pub session_magic: u32,
}

impl WireMessage for NqConnectRequest {
    const NAME: &'static str = "NQ_CONNECT request";
    const SIZE: usize = 16;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.device_id.as_u32());
        buf.put_u32_le(self.device_session_id);
        buf.put_u32_le(self.session_id.as_u32());
        buf.put_u32_le(self.session_magic);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            device_id: DeviceId::new(buf.get_u32_le()),
            device_session_id: buf.get_u32_le(),
            session_id: SessionId::new(buf.get_u32_le()),
            session_magic: buf.get_u32_le(),
        }
    }
}

/// `MAP_BULK_BUF` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapBulkRequest {
    /// Session receiving the mapping.
    pub session_id: SessionId,
    /// Driver handle of the registered client buffer.
    pub handle: WsmHandle,
    /// Physical address of the buffer's page table.
    pub l2_phys_addr: u64,
    /// Offset of the payload within the first page.
    pub offset: u32,
    /// Payload length.
    pub len: u32,
}

impl WireMessage for MapBulkRequest {
    const NAME: &'static str = "MAP_BULK_BUF request";
    const SIZE: usize = 4 + 4 + 8 + 4 + 4;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.session_id.as_u32());
        buf.put_u32_le(self.handle.as_u32());
        buf.put_u64_le(self.l2_phys_addr);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.len);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            session_id: SessionId::new(buf.get_u32_le()),
            handle: WsmHandle::new(buf.get_u32_le()),
            l2_phys_addr: buf.get_u64_le(),
            offset: buf.get_u32_le(),
            len: buf.get_u32_le(),
        }
    }
}

/// `MAP_BULK_BUF` response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapBulkResponse {
    /// Session the buffer was mapped into.
    pub session_id: SessionId,
    /// Address of the buffer in the trustlet's address space.
    pub secure_virtual_addr: u32,
}

impl WireMessage for MapBulkResponse {
    const NAME: &'static str = "MAP_BULK_BUF response";
    const SIZE: usize = 8;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.session_id.as_u32());
        buf.put_u32_le(self.secure_virtual_addr);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            session_id: SessionId::new(buf.get_u32_le()),
            secure_virtual_addr: buf.get_u32_le(),
        }
    }
}

/// `UNMAP_BULK_BUF` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapBulkRequest {
    /// Session owning the mapping.
    pub session_id: SessionId,
    /// Driver handle of the mapped buffer.
    pub handle: WsmHandle,
    /// Address returned by `MAP_BULK_BUF`.
    pub secure_virtual_addr: u32,
    /// Payload length.
    pub len: u32,
}

impl WireMessage for UnmapBulkRequest {
    const NAME: &'static str = "UNMAP_BULK_BUF request";
    const SIZE: usize = 16;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.session_id.as_u32());
        buf.put_u32_le(self.handle.as_u32());
        buf.put_u32_le(self.secure_virtual_addr);
        buf.put_u32_le(self.len);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            session_id: SessionId::new(buf.get_u32_le()),
            handle: WsmHandle::new(buf.get_u32_le()),
            secure_virtual_addr: buf.get_u32_le(),
            len: buf.get_u32_le(),
        }
    }
}

/// `GET_VERSION` response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetVersionResponse {
    /// Daemon protocol version.
    pub version: u32,
}

impl WireMessage for GetVersionResponse {
    const NAME: &'static str = "GET_VERSION response";
    const SIZE: usize = 4;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.version);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            version: buf.get_u32_le(),
        }
    }
}

impl WireMessage for MonitorVersion {
    const NAME: &'static str = "GET_MOBICORE_VERSION response";
    const SIZE: usize = Self::ENCODED_LEN;

    fn encode_into(&self, buf: &mut BytesMut) {
        self.write_to(buf);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self::read_from(buf)
    }
}

impl WireMessage for Notification {
    const NAME: &'static str = "notification";
    const SIZE: usize = 8;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.session_id.as_u32());
        buf.put_i32_le(self.payload);
    }

    fn decode_from(buf: &mut Bytes) -> Self {
        Self {
            session_id: SessionId::new(buf.get_u32_le()),
            payload: buf.get_i32_le(),
        }
    }
}

/// Encodes a request: header followed by `payload`.
#[must_use]
pub fn encode_request<M: WireMessage>(command: CommandId, payload: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + M::SIZE);
    CommandHeader::new(command).encode_into(&mut buf);
    payload.encode_into(&mut buf);
    buf.freeze()
}

/// Encodes a response: header followed by `payload`.
#[must_use]
pub fn encode_response<M: WireMessage>(code: ResponseCode, payload: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + M::SIZE);
    ResponseHeader::new(code).encode_into(&mut buf);
    payload.encode_into(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_are_stable() {
        for raw in 0..=11 {
            let command = CommandId::from_u32(raw).unwrap();
            assert_eq!(command.as_u32(), raw);
        }
        assert_eq!(CommandId::from_u32(12), Err(WireError::UnknownCommand(12)));
        assert_eq!(CommandId::NqConnect.as_u32(), 4);
        assert_eq!(CommandId::GetMobicoreVersion.as_u32(), 11);
    }

    #[test]
    fn only_notify_is_unanswered() {
        assert!(!CommandId::Notify.has_response());
        assert!(CommandId::OpenSession.has_response());
        assert!(CommandId::Ping.has_response());
    }

    #[test]
    fn response_codes_are_stable() {
        for raw in 0..=13 {
            assert_eq!(ResponseCode::from_u32(raw).unwrap().as_u32(), raw);
        }
        assert_eq!(ResponseCode::UnknownSession.as_u32(), 9);
        assert_eq!(ResponseCode::DaemonUnreachable.as_u32(), 13);
        assert!(ResponseCode::from_u32(14).is_err());
    }

    #[test]
    fn open_session_request_layout() {
        let uuid = Uuid::from_bytes([0xAB; 16]);
        let request = OpenSessionRequest {
            device_id: DeviceId::new(1),
            uuid,
            tci_handle: WsmHandle::new(0x0102_0304),
            tci_len: 4096,
        };
        let bytes = request.encode();
        assert_eq!(bytes.len(), OpenSessionRequest::SIZE);
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..20], uuid.as_bytes());
        assert_eq!(&bytes[20..24], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(OpenSessionRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = MapBulkRequest::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                message: "MAP_BULK_BUF request",
                expected: 24,
                actual: 10,
            }
        );
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut bytes = SessionRequest {
            session_id: SessionId::new(5),
        }
        .encode()
        .to_vec();
        bytes.extend_from_slice(&[0xFF; 4]);
        let decoded = SessionRequest::decode(&bytes).unwrap();
        assert_eq!(decoded.session_id, SessionId::new(5));
    }

    #[test]
    fn notification_payload_is_signed() {
        let notification = Notification::new(SessionId::new(3), -5);
        let bytes = notification.encode();
        assert_eq!(&bytes[4..], &(-5i32).to_le_bytes());
        assert_eq!(Notification::decode(&bytes).unwrap(), notification);
    }

    #[test]
    fn request_framing() {
        let bytes = encode_request(
            CommandId::CloseSession,
            &SessionRequest {
                session_id: SessionId::new(9),
            },
        );
        assert_eq!(bytes.len(), HEADER_SIZE + SessionRequest::SIZE);
        let header = CommandHeader::decode(&bytes).unwrap();
        assert_eq!(header.command().unwrap(), CommandId::CloseSession);
    }
}
