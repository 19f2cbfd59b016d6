//! Client command processor.
//!
//! Reads one command from a readable connection, executes it against the
//! device the connection is bound to and writes the response.
//!
//! # Message Flow
//!
//! ```text
//! command header (4 bytes) ──▶ fixed-size payload ──▶ Device
//!                                                       │
//! response header (4 bytes) ◀── optional payload ◀──────┘
//! ```
//!
//! # Invariants
//!
//! - Every command except `NOTIFY` is answered with exactly one response
//!   header; errors carry no payload.
//! - A malformed or truncated command drops the connection and nothing
//!   else.
//! - A connection bound to a device can never become a notification
//!   channel, and a notification channel accepts no further commands.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace, warn};
use tzd_core::DAEMON_VERSION;
use tzd_core::wire::{
    CommandHeader, CommandId, GetVersionResponse, HEADER_SIZE, MapBulkRequest, MapBulkResponse,
    NqConnectRequest, OpenDeviceRequest, OpenSessionRequest, ResponseCode, ResponseHeader,
    SessionRequest, UnmapBulkRequest, WireError, WireMessage, encode_response,
};

use crate::connection::{ConnectionError, SharedConnection, read_exact, write_all};
use crate::device::{Device, DeviceError};
use crate::server::ConnectionHandler;
use crate::state::SharedContext;

/// Reasons a connection is dropped.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Transport failure or timeout.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The command could not be decoded.
    #[error("malformed command: {0}")]
    Wire(#[from] WireError),
}

/// Result type for command processing.
pub type CommandResult<T> = Result<T, CommandError>;

/// Executes client commands.
pub struct Daemon {
    context: SharedContext,
    command_timeout: Duration,
}

impl Daemon {
    /// Creates a processor over `context`.
    ///
    /// `command_timeout` bounds the read of one complete command once its
    /// first byte has arrived.
    #[must_use]
    pub const fn new(context: SharedContext, command_timeout: Duration) -> Self {
        Self {
            context,
            command_timeout,
        }
    }

    /// Shared state.
    #[must_use]
    pub const fn context(&self) -> &SharedContext {
        &self.context
    }

    fn read_message<M: WireMessage>(&self, connection: &SharedConnection) -> CommandResult<M> {
        let mut buf = vec![0u8; M::SIZE];
        read_exact(connection.as_ref(), &mut buf, Some(self.command_timeout))?;
        Ok(M::decode(&buf)?)
    }

    fn respond(connection: &SharedConnection, code: ResponseCode) -> CommandResult<()> {
        write_all(connection.as_ref(), &ResponseHeader::new(code).encode())?;
        Ok(())
    }

    fn respond_ok<M: WireMessage>(connection: &SharedConnection, payload: &M) -> CommandResult<()> {
        write_all(connection.as_ref(), &encode_response(ResponseCode::Ok, payload))?;
        Ok(())
    }

    fn respond_error(connection: &SharedConnection, error: &DeviceError) -> CommandResult<()> {
        let code = error.response_code();
        debug!(connection = %connection.id(), %error, %code, "command failed");
        Self::respond(connection, code)
    }

    fn bound_device(&self, connection: &SharedConnection) -> Option<Arc<dyn Device>> {
        self.context.device_for(connection.id())
    }

    /// Reads and executes one command.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection must be dropped.
    pub fn process_command(&self, connection: &SharedConnection) -> CommandResult<()> {
        let mut raw = [0u8; HEADER_SIZE];
        read_exact(connection.as_ref(), &mut raw, Some(self.command_timeout))?;
        let command = CommandHeader::decode(&raw)?.command()?;
        trace!(connection = %connection.id(), %command, "command");

        match command {
            CommandId::Ping => Self::respond(connection, ResponseCode::Ok),
            CommandId::GetInfo => Self::respond(connection, ResponseCode::CommandNotAllowed),
            CommandId::GetVersion => Self::respond_ok(
                connection,
                &GetVersionResponse {
                    version: DAEMON_VERSION,
                },
            ),
            CommandId::OpenDevice => self.open_device(connection),
            CommandId::CloseDevice => self.close_device(connection),
            CommandId::NqConnect => self.nq_connect(connection),
            CommandId::OpenSession => self.open_session(connection),
            CommandId::CloseSession => self.close_session(connection),
            CommandId::Notify => self.notify(connection),
            CommandId::MapBulkBuf => self.map_bulk(connection),
            CommandId::UnmapBulkBuf => self.unmap_bulk(connection),
            CommandId::GetMobicoreVersion => self.mobicore_version(connection),
        }
    }

    fn open_device(&self, connection: &SharedConnection) -> CommandResult<()> {
        let request: OpenDeviceRequest = self.read_message(connection)?;
        if self.context.is_bound(connection.id()) {
            return Self::respond(connection, ResponseCode::DeviceAlreadyOpened);
        }
        let Some(device) = self.context.device(request.device_id) else {
            return Self::respond(connection, ResponseCode::InvalidDeviceName);
        };
        if let Err(e) = device.open(connection) {
            return Self::respond_error(connection, &e);
        }
        if !self.context.bind(connection.id(), device.id()) {
            device.close(connection);
            return Self::respond(connection, ResponseCode::DeviceAlreadyOpened);
        }
        info!(connection = %connection.id(), peer = %connection.peer(), device_id = %device.id(), "device opened");
        Self::respond(connection, ResponseCode::Ok)
    }

    fn close_device(&self, connection: &SharedConnection) -> CommandResult<()> {
        let Some(device) = self.context.unbind(connection.id()) else {
            return Self::respond(connection, ResponseCode::DeviceNotOpened);
        };
        device.close(connection);
        info!(connection = %connection.id(), device_id = %device.id(), "device closed");
        Self::respond(connection, ResponseCode::Ok)
    }

    fn nq_connect(&self, connection: &SharedConnection) -> CommandResult<()> {
        let request: NqConnectRequest = self.read_message(connection)?;
        if self.context.is_bound(connection.id()) {
            return Self::respond(connection, ResponseCode::CommandNotAllowed);
        }
        let Some(device) = self.context.device(request.device_id) else {
            return Self::respond(connection, ResponseCode::InvalidDeviceName);
        };
        let ack = ResponseHeader::new(ResponseCode::Ok).encode();
        match device.register_trustlet_connection(connection, &request, &ack) {
            Some(session) => {
                connection.detach();
                debug!(connection = %connection.id(), session_id = %session.id(), "connection now carries notifications");
                Ok(())
            },
            None => {
                debug!(connection = %connection.id(), session_id = %request.session_id, "no session matches notification credentials");
                Self::respond(connection, ResponseCode::UnknownSession)
            },
        }
    }

    fn open_session(&self, connection: &SharedConnection) -> CommandResult<()> {
        let request: OpenSessionRequest = self.read_message(connection)?;
        let Some(device) = self.bound_device(connection) else {
            return Self::respond(connection, ResponseCode::DeviceNotOpened);
        };
        if device.id() != request.device_id {
            return Self::respond(connection, ResponseCode::DeviceNotOpened);
        }
        match device.open_session(connection, &request) {
            Ok(response) => Self::respond_ok(connection, &response),
            Err(e) => Self::respond_error(connection, &e),
        }
    }

    fn close_session(&self, connection: &SharedConnection) -> CommandResult<()> {
        let request: SessionRequest = self.read_message(connection)?;
        let Some(device) = self.bound_device(connection) else {
            return Self::respond(connection, ResponseCode::DeviceNotOpened);
        };
        match device.close_trustlet_session(connection, request.session_id) {
            Ok(()) => Self::respond(connection, ResponseCode::Ok),
            Err(e) => Self::respond_error(connection, &e),
        }
    }

    fn notify(&self, connection: &SharedConnection) -> CommandResult<()> {
        let request: SessionRequest = self.read_message(connection)?;
        match self.bound_device(connection) {
            Some(device) => device.notify(connection, request.session_id),
            None => warn!(connection = %connection.id(), session_id = %request.session_id, "notify without an open device"),
        }
        Ok(())
    }

    fn map_bulk(&self, connection: &SharedConnection) -> CommandResult<()> {
        let request: MapBulkRequest = self.read_message(connection)?;
        let Some(device) = self.bound_device(connection) else {
            return Self::respond(connection, ResponseCode::DeviceNotOpened);
        };
        match device.map_bulk(connection, &request) {
            Ok(secure_virtual_addr) => Self::respond_ok(
                connection,
                &MapBulkResponse {
                    session_id: request.session_id,
                    secure_virtual_addr,
                },
            ),
            Err(e) => Self::respond_error(connection, &e),
        }
    }

    fn unmap_bulk(&self, connection: &SharedConnection) -> CommandResult<()> {
        let request: UnmapBulkRequest = self.read_message(connection)?;
        let Some(device) = self.bound_device(connection) else {
            return Self::respond(connection, ResponseCode::DeviceNotOpened);
        };
        match device.unmap_bulk(connection, &request) {
            Ok(()) => Self::respond(connection, ResponseCode::Ok),
            Err(e) => Self::respond_error(connection, &e),
        }
    }

    fn mobicore_version(&self, connection: &SharedConnection) -> CommandResult<()> {
        let Some(device) = self.bound_device(connection) else {
            return Self::respond(connection, ResponseCode::DeviceNotOpened);
        };
        match device.mobicore_version() {
            Ok(version) => Self::respond_ok(connection, &version),
            Err(e) => Self::respond_error(connection, &e),
        }
    }
}

impl ConnectionHandler for Daemon {
    fn handle_connection(&self, connection: &SharedConnection) -> bool {
        match self.process_command(connection) {
            Ok(()) => true,
            Err(CommandError::Connection(ConnectionError::Closed)) => {
                debug!(connection = %connection.id(), "client disconnected");
                false
            },
            Err(e) => {
                warn!(connection = %connection.id(), error = %e, "dropping client connection");
                false
            },
        }
    }

    fn drop_connection(&self, connection: &SharedConnection) {
        self.context.drop_connection(connection);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use bytes::Bytes;
    use tzd_core::emulator::MonitorEmulator;
    use tzd_core::registry::MemoryRegistry;
    use tzd_core::wire::encode_request;
    use tzd_core::{DeviceId, SessionId};

    use super::*;
    use crate::connection::StreamConnection;
    use crate::device::{TrustZoneDevice, TrustZoneDeviceConfig};
    use crate::state::DaemonContext;

    struct Harness {
        daemon: Daemon,
        device: Arc<TrustZoneDevice>,
        client: UnixStream,
        connection: SharedConnection,
    }

    fn harness() -> Harness {
        let device = Arc::new(
            TrustZoneDevice::start(
                TrustZoneDeviceConfig::default(),
                Arc::new(MonitorEmulator::new()),
                Arc::new(MemoryRegistry::new()),
            )
            .unwrap(),
        );
        let as_device: Arc<dyn Device> = device.clone();
        let context = Arc::new(DaemonContext::new([as_device]));
        let (client, server) = UnixStream::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Harness {
            daemon: Daemon::new(context, Duration::from_millis(200)),
            device,
            client,
            connection: Arc::new(StreamConnection::new(server)),
        }
    }

    impl Harness {
        fn exchange(&mut self, request: &[u8]) -> bool {
            self.client.write_all(request).unwrap();
            self.daemon.handle_connection(&self.connection)
        }

        fn response_code(&mut self) -> ResponseCode {
            let mut raw = [0u8; HEADER_SIZE];
            self.client.read_exact(&mut raw).unwrap();
            ResponseHeader::decode(&raw).unwrap().code().unwrap()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.device.shutdown();
        }
    }

    fn header(command: CommandId) -> Bytes {
        CommandHeader::new(command).encode()
    }

    #[test]
    fn ping_and_version() {
        let mut h = harness();
        assert!(h.exchange(&header(CommandId::Ping)));
        assert_eq!(h.response_code(), ResponseCode::Ok);

        assert!(h.exchange(&header(CommandId::GetVersion)));
        assert_eq!(h.response_code(), ResponseCode::Ok);
        let mut raw = [0u8; GetVersionResponse::SIZE];
        h.client.read_exact(&mut raw).unwrap();
        assert_eq!(GetVersionResponse::decode(&raw).unwrap().version, DAEMON_VERSION);
    }

    #[test]
    fn get_info_is_refused() {
        let mut h = harness();
        assert!(h.exchange(&header(CommandId::GetInfo)));
        assert_eq!(h.response_code(), ResponseCode::CommandNotAllowed);
    }

    #[test]
    fn open_device_twice() {
        let mut h = harness();
        let request = encode_request(CommandId::OpenDevice, &OpenDeviceRequest {
            device_id: DeviceId::new(0),
        });
        assert!(h.exchange(&request));
        assert_eq!(h.response_code(), ResponseCode::Ok);
        assert!(h.exchange(&request));
        assert_eq!(h.response_code(), ResponseCode::DeviceAlreadyOpened);
    }

    #[test]
    fn unknown_device() {
        let mut h = harness();
        let request = encode_request(CommandId::OpenDevice, &OpenDeviceRequest {
            device_id: DeviceId::new(7),
        });
        assert!(h.exchange(&request));
        assert_eq!(h.response_code(), ResponseCode::InvalidDeviceName);
    }

    #[test]
    fn session_commands_need_an_open_device() {
        let mut h = harness();
        let request = encode_request(CommandId::CloseSession, &SessionRequest {
            session_id: SessionId::new(1),
        });
        assert!(h.exchange(&request));
        assert_eq!(h.response_code(), ResponseCode::DeviceNotOpened);

        assert!(h.exchange(&header(CommandId::CloseDevice)));
        assert_eq!(h.response_code(), ResponseCode::DeviceNotOpened);
    }

    #[test]
    fn unknown_command_drops_connection() {
        let mut h = harness();
        assert!(!h.exchange(&99u32.to_le_bytes()));
    }

    #[test]
    fn truncated_payload_drops_connection() {
        let mut h = harness();
        let mut request = header(CommandId::OpenDevice).to_vec();
        request.extend_from_slice(&[0, 0]);
        assert!(!h.exchange(&request));
    }

    #[test]
    fn bound_connection_cannot_become_notification_channel() {
        let mut h = harness();
        let open = encode_request(CommandId::OpenDevice, &OpenDeviceRequest {
            device_id: DeviceId::new(0),
        });
        assert!(h.exchange(&open));
        assert_eq!(h.response_code(), ResponseCode::Ok);

        let connect = encode_request(CommandId::NqConnect, &NqConnectRequest {
            device_id: DeviceId::new(0),
            device_session_id: 1,
            session_id: SessionId::new(1),
            session_magic: 0,
        });
        assert!(h.exchange(&connect));
        assert_eq!(h.response_code(), ResponseCode::CommandNotAllowed);
        assert!(!h.connection.is_detached());
    }

    #[test]
    fn nq_connect_for_unknown_session() {
        let mut h = harness();
        let connect = encode_request(CommandId::NqConnect, &NqConnectRequest {
            device_id: DeviceId::new(0),
            device_session_id: 1,
            session_id: SessionId::new(1),
            session_magic: 0,
        });
        assert!(h.exchange(&connect));
        assert_eq!(h.response_code(), ResponseCode::UnknownSession);
        assert!(!h.connection.is_detached());
    }
}
