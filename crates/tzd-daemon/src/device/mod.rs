//! Secure-world devices.
//!
//! A [`Device`] is one secure-world instance reached through one mailbox.
//! Client connections bind to a device with `OPEN_DEVICE`; every session a
//! connection opens belongs to that device and is torn down when the
//! connection closes the device or disconnects.
//!
//! [`TrustZoneDevice`] is the implementation driving a secure monitor
//! through a [`KernelDriver`](tzd_core::driver::KernelDriver).

mod mcp_channel;
mod trustzone;

use std::sync::Arc;

use thiserror::Error;
use tzd_core::driver::DriverError;
use tzd_core::mailbox::MailboxError;
use tzd_core::mcp::{McpCommandId, McpResult};
use tzd_core::registry::RegistryError;
use tzd_core::wire::{
    MapBulkRequest, NqConnectRequest, OpenSessionRequest, OpenSessionResponse, ResponseCode,
    UnmapBulkRequest,
};
use tzd_core::{DeviceId, SessionId, WsmHandle};
use tzd_core::types::MonitorVersion;

pub use self::mcp_channel::{McpChannel, McpChannelConfig, ProtocolStats, WaitResult};
pub use self::trustzone::{TrustZoneDevice, TrustZoneDeviceConfig};
use crate::connection::SharedConnection;
use crate::session::{SessionError, TrustletSession};

/// Device errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The session does not exist or is not owned by the caller.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The trustlet could not be loaded.
    #[error("trustlet unavailable: {0}")]
    Trustlet(#[from] RegistryError),

    /// The world-shared memory handle is unknown to the driver.
    #[error("world-shared memory {0} not found")]
    WsmNotFound(WsmHandle),

    /// A request field is invalid.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A local resource could not be obtained.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Bulk buffer bookkeeping rejected the request.
    #[error("bulk buffer: {0}")]
    Bulk(#[from] SessionError),

    /// The monitor answered with a failure result.
    #[error("monitor rejected {command}: {result}")]
    Rejected {
        /// Command that failed.
        command: McpCommandId,
        /// Result word.
        result: McpResult,
    },

    /// The monitor is dead or the control channel is corrupted.
    #[error("secure monitor unreachable")]
    Unreachable,

    /// The monitor did not finish initialisation.
    #[error("secure monitor did not initialise after {attempts} status checks")]
    NotInitialized {
        /// Status checks performed.
        attempts: u32,
    },

    /// Kernel driver failure.
    #[error("kernel driver: {0}")]
    Driver(#[from] DriverError),

    /// Mailbox failure.
    #[error("mailbox: {0}")]
    Mailbox(#[from] MailboxError),
}

impl DeviceError {
    /// Whether the device is faulted; nothing will succeed after this.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unreachable)
    }

    /// Maps the error onto the client response codes.
    #[must_use]
    pub const fn response_code(&self) -> ResponseCode {
        match self {
            Self::UnknownSession(_) => ResponseCode::UnknownSession,
            Self::Trustlet(_) => ResponseCode::TrustletNotFound,
            Self::WsmNotFound(_) | Self::Driver(DriverError::NotFound(_)) => {
                ResponseCode::WsmNotFound
            },
            Self::InvalidParameter(_) => ResponseCode::InvalidParameter,
            Self::OutOfResources(_) | Self::Driver(DriverError::OutOfMemory { .. }) => {
                ResponseCode::OutOfResources
            },
            Self::Bulk(_) => ResponseCode::MapBulkError,
            Self::Rejected { result, .. } => match result {
                McpResult::InvalidSession => ResponseCode::UnknownSession,
                McpResult::UnknownUuid | McpResult::TrustletInvalid => {
                    ResponseCode::TrustletNotFound
                },
                McpResult::NoMoreSessions | McpResult::OutOfResources => {
                    ResponseCode::OutOfResources
                },
                McpResult::InvalidParam => ResponseCode::InvalidParameter,
                McpResult::AlreadyMapped | McpResult::InvalidWsm => ResponseCode::MapBulkError,
                _ => ResponseCode::Failed,
            },
            Self::Unreachable => ResponseCode::DaemonUnreachable,
            Self::NotInitialized { .. } | Self::Driver(_) | Self::Mailbox(_) => {
                ResponseCode::Failed
            },
        }
    }
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// One secure-world instance.
///
/// `owner` arguments identify the client connection issuing the request;
/// session operations only touch sessions that connection opened.
pub trait Device: Send + Sync {
    /// Device identifier.
    fn id(&self) -> DeviceId;

    /// Binds a client connection.
    fn open(&self, owner: &SharedConnection) -> DeviceResult<()>;

    /// Unbinds a client connection, tearing down every session it opened
    /// in reverse creation order. Best effort; never fails.
    fn close(&self, owner: &SharedConnection);

    /// Loads a trustlet and opens a session owned by `owner`.
    fn open_session(
        &self,
        owner: &SharedConnection,
        request: &OpenSessionRequest,
    ) -> DeviceResult<OpenSessionResponse>;

    /// Attaches `connection` as the notification channel of the session
    /// matching all three credentials of `request`.
    ///
    /// `ack` is written on the connection before any queued notification.
    /// Returns `None` if no open session matches or the ack cannot be
    /// written; the connection is then left unattached.
    fn register_trustlet_connection(
        &self,
        connection: &SharedConnection,
        request: &NqConnectRequest,
        ack: &[u8],
    ) -> Option<Arc<TrustletSession>>;

    /// Sends `CLOSE_SESSION` to the monitor without touching local state.
    fn close_session(&self, session_id: SessionId) -> DeviceResult<()>;

    /// Closes a session owned by `owner` and releases its resources.
    fn close_trustlet_session(
        &self,
        owner: &SharedConnection,
        session_id: SessionId,
    ) -> DeviceResult<()>;

    /// Maps a client buffer into a session; returns the trustlet address.
    fn map_bulk(&self, owner: &SharedConnection, request: &MapBulkRequest) -> DeviceResult<u32>;

    /// Unmaps a client buffer from a session.
    fn unmap_bulk(&self, owner: &SharedConnection, request: &UnmapBulkRequest)
    -> DeviceResult<()>;

    /// Signals a trustlet. Requests for unknown sessions are dropped.
    fn notify(&self, owner: &SharedConnection, session_id: SessionId);

    /// Donates `len` bytes of normal-world memory to the secure world.
    fn donate_ram(&self, len: u32) -> DeviceResult<()>;

    /// Monitor version block (queried once, then cached).
    fn mobicore_version(&self) -> DeviceResult<MonitorVersion>;

    /// Whether the monitor has been declared unreachable.
    fn is_faulted(&self) -> bool;

    /// Tears down every session and stops the device's threads.
    fn shutdown(&self);
}
