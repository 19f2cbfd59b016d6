//! Client protocol over the Unix stream listener.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tzd_core::driver::KernelDriver;
use tzd_core::emulator::MonitorEmulator;
use tzd_core::registry::MemoryRegistry;
use tzd_core::types::MonitorVersion;
use tzd_core::wire::{
    CommandHeader, CommandId, HEADER_SIZE, NqConnectRequest, OpenDeviceRequest,
    OpenSessionRequest, OpenSessionResponse, ResponseCode, ResponseHeader, SessionRequest,
    WireMessage, encode_request,
};
use tzd_core::{DeviceId, Notification};
use tzd_daemon::daemon::Daemon;
use tzd_daemon::device::{Device, TrustZoneDevice, TrustZoneDeviceConfig};
use tzd_daemon::server::{StreamServer, StreamServerConfig};
use tzd_daemon::state::DaemonContext;
use uuid::Uuid;

const TRUSTLET: Uuid = Uuid::from_bytes([0x11; 16]);

struct Running {
    _dir: TempDir,
    socket: std::path::PathBuf,
    emulator: Arc<MonitorEmulator>,
    device: Arc<TrustZoneDevice>,
    context: Arc<DaemonContext>,
    listener: Option<JoinHandle<()>>,
}

impl Running {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("tzd.sock");
        let emulator = Arc::new(MonitorEmulator::new());
        let registry = Arc::new(MemoryRegistry::new());
        registry.insert(TRUSTLET, vec![1u8; 1024]).unwrap();
        let device = Arc::new(
            TrustZoneDevice::start(
                TrustZoneDeviceConfig {
                    irq_poll: Duration::from_millis(20),
                    ..TrustZoneDeviceConfig::default()
                },
                emulator.clone(),
                registry,
            )
            .unwrap(),
        );
        let as_device: Arc<dyn Device> = device.clone();
        let context = Arc::new(DaemonContext::new([as_device]));
        let handler = Daemon::new(Arc::clone(&context), Duration::from_secs(1));
        let mut server = StreamServer::bind(StreamServerConfig {
            path: socket.clone(),
            mode: 0o660,
            poll_interval: Duration::from_millis(20),
        })
        .unwrap();
        let shutdown = context.shutdown_flag();
        let listener = thread::spawn(move || {
            server.run(&handler, &shutdown).unwrap();
        });
        Self {
            _dir: dir,
            socket,
            emulator,
            device,
            context,
            listener: Some(listener),
        }
    }

    fn connect(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.socket).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.context.request_shutdown();
        if let Some(listener) = self.listener.take() {
            listener.join().unwrap();
        }
        self.context.shutdown_devices();
    }
}

fn send(stream: &mut UnixStream, bytes: &[u8]) {
    stream.write_all(bytes).unwrap();
}

fn response_code(stream: &mut UnixStream) -> ResponseCode {
    let mut raw = [0u8; HEADER_SIZE];
    stream.read_exact(&mut raw).unwrap();
    ResponseHeader::decode(&raw).unwrap().code().unwrap()
}

fn read_payload<M: WireMessage>(stream: &mut UnixStream) -> M {
    let mut raw = vec![0u8; M::SIZE];
    stream.read_exact(&mut raw).unwrap();
    M::decode(&raw).unwrap()
}

fn open_device(stream: &mut UnixStream) {
    send(
        stream,
        &encode_request(CommandId::OpenDevice, &OpenDeviceRequest {
            device_id: DeviceId::new(0),
        }),
    );
    assert_eq!(response_code(stream), ResponseCode::Ok);
}

fn open_session(running: &Running, stream: &mut UnixStream) -> OpenSessionResponse {
    let tci = running.emulator.alloc_wsm(4096).unwrap();
    send(
        stream,
        &encode_request(CommandId::OpenSession, &OpenSessionRequest {
            device_id: DeviceId::new(0),
            uuid: TRUSTLET,
            tci_handle: tci.handle,
            tci_len: 4096,
        }),
    );
    assert_eq!(response_code(stream), ResponseCode::Ok);
    read_payload(stream)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn session_lifecycle_over_the_socket() {
    let running = Running::start();
    let mut client = running.connect();
    open_device(&mut client);
    let session = open_session(&running, &mut client);

    let mut nq = running.connect();
    send(
        &mut nq,
        &encode_request(CommandId::NqConnect, &NqConnectRequest {
            device_id: DeviceId::new(0),
            device_session_id: session.device_session_id,
            session_id: session.session_id,
            session_magic: session.session_magic,
        }),
    );
    assert_eq!(response_code(&mut nq), ResponseCode::Ok);

    send(
        &mut client,
        &encode_request(CommandId::Notify, &SessionRequest {
            session_id: session.session_id,
        }),
    );
    let notification: Notification = read_payload(&mut nq);
    assert_eq!(notification.session_id, session.session_id);
    assert_eq!(notification.payload, 0);

    send(
        &mut client,
        &encode_request(CommandId::CloseSession, &SessionRequest {
            session_id: session.session_id,
        }),
    );
    assert_eq!(response_code(&mut client), ResponseCode::Ok);
    assert_eq!(running.device.session_count(), 0);

    let mut buf = [0u8; 1];
    assert_eq!(nq.read(&mut buf).unwrap(), 0);
}

#[test]
fn monitor_version_over_the_socket() {
    let running = Running::start();
    let mut client = running.connect();
    send(&mut client, &CommandHeader::new(CommandId::GetMobicoreVersion).encode());
    assert_eq!(response_code(&mut client), ResponseCode::DeviceNotOpened);

    open_device(&mut client);
    send(&mut client, &CommandHeader::new(CommandId::GetMobicoreVersion).encode());
    assert_eq!(response_code(&mut client), ResponseCode::Ok);
    let version: MonitorVersion = read_payload(&mut client);
    assert!(!version.product_id.is_empty());
}

#[test]
fn disconnect_tears_down_owned_sessions() {
    let running = Running::start();
    let mut client = running.connect();
    open_device(&mut client);
    let first = open_session(&running, &mut client);
    let second = open_session(&running, &mut client);
    assert_eq!(running.device.session_count(), 2);

    drop(client);
    assert!(wait_until(|| running.device.session_count() == 0));
    assert!(!running.emulator.has_session(first.session_id));
    assert!(!running.emulator.has_session(second.session_id));
    assert_eq!(running.context.bound_connections(), 0);
}

#[test]
fn malformed_command_closes_only_that_connection() {
    let running = Running::start();
    let mut bad = running.connect();
    let mut good = running.connect();

    send(&mut bad, &0xFFFF_u32.to_le_bytes());
    let mut buf = [0u8; 1];
    assert_eq!(bad.read(&mut buf).unwrap(), 0);

    send(&mut good, &CommandHeader::new(CommandId::Ping).encode());
    assert_eq!(response_code(&mut good), ResponseCode::Ok);
}

#[test]
fn socket_file_is_removed_on_shutdown() {
    let running = Running::start();
    let socket = running.socket.clone();
    assert!(socket.exists());
    drop(running);
    assert!(!socket.exists());
}
