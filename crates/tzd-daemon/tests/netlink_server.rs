//! Client protocol over the datagram listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tzd_core::driver::KernelDriver;
use tzd_core::emulator::MonitorEmulator;
use tzd_core::registry::MemoryRegistry;
use tzd_core::wire::{
    CommandHeader, CommandId, HEADER_SIZE, NqConnectRequest, OpenDeviceRequest,
    OpenSessionRequest, OpenSessionResponse, ResponseCode, ResponseHeader, SessionRequest,
    WireMessage, encode_request,
};
use tzd_core::{DeviceId, Notification};
use tzd_daemon::connection::{
    DATAGRAM_HEADER_SIZE, DatagramHeader, DatagramSocket, MAX_DATAGRAM_SIZE,
    PairedDatagramSocket, PeerKey,
};
use tzd_daemon::daemon::Daemon;
use tzd_daemon::device::{Device, TrustZoneDevice, TrustZoneDeviceConfig};
use tzd_daemon::server::{NetlinkServer, NetlinkServerConfig};
use tzd_daemon::state::DaemonContext;
use uuid::Uuid;

const TRUSTLET: Uuid = Uuid::from_bytes([0x22; 16]);
const CLIENT_PID: u32 = 4242;

struct Running {
    client: PairedDatagramSocket,
    emulator: Arc<MonitorEmulator>,
    device: Arc<TrustZoneDevice>,
    context: Arc<DaemonContext>,
    dead_pid: Arc<AtomicU32>,
    listener: Option<JoinHandle<()>>,
}

impl Running {
    fn start() -> Self {
        let emulator = Arc::new(MonitorEmulator::new());
        let registry = Arc::new(MemoryRegistry::new());
        registry.insert(TRUSTLET, vec![2u8; 1024]).unwrap();
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

        let (daemon_end, client) = PairedDatagramSocket::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let dead_pid = Arc::new(AtomicU32::new(0));
        let dead = Arc::clone(&dead_pid);
        let mut server = NetlinkServer::with_liveness_check(
            NetlinkServerConfig {
                poll_interval: Duration::from_millis(20),
                reap_interval: Duration::from_millis(20),
            },
            Arc::new(daemon_end),
            Box::new(move |pid| pid != dead.load(Ordering::SeqCst)),
        );
        let shutdown = context.shutdown_flag();
        let listener = thread::spawn(move || {
            server.run(&handler, &shutdown).unwrap();
        });
        Self {
            client,
            emulator,
            device,
            context,
            dead_pid,
            listener: Some(listener),
        }
    }

    fn send(&self, key: PeerKey, bytes: &[u8]) {
        self.client
            .send(&DatagramHeader::frame(key, key.pid, bytes))
            .unwrap();
    }

    /// Receives the next datagram, returning its peer key and payload.
    fn receive(&self) -> (PeerKey, Vec<u8>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let n = self.client.recv(&mut buf).unwrap();
        let header = DatagramHeader::parse(&buf[..n]).unwrap();
        (
            PeerKey::new(CLIENT_PID, header.seq),
            buf[DATAGRAM_HEADER_SIZE..header.len as usize].to_vec(),
        )
    }

    fn expect_response(&self, key: PeerKey) -> (ResponseCode, Vec<u8>) {
        let (from, payload) = self.receive();
        assert_eq!(from, key);
        let code = ResponseHeader::decode(&payload[..HEADER_SIZE])
            .unwrap()
            .code()
            .unwrap();
        (code, payload[HEADER_SIZE..].to_vec())
    }

    fn open_device(&self, key: PeerKey) {
        self.send(
            key,
            &encode_request(CommandId::OpenDevice, &OpenDeviceRequest {
                device_id: DeviceId::new(0),
            }),
        );
        assert_eq!(self.expect_response(key).0, ResponseCode::Ok);
    }

    fn open_session(&self, key: PeerKey) -> OpenSessionResponse {
        let tci = self.emulator.alloc_wsm(4096).unwrap();
        self.send(
            key,
            &encode_request(CommandId::OpenSession, &OpenSessionRequest {
                device_id: DeviceId::new(0),
                uuid: TRUSTLET,
                tci_handle: tci.handle,
                tci_len: 4096,
            }),
        );
        let (code, payload) = self.expect_response(key);
        assert_eq!(code, ResponseCode::Ok);
        OpenSessionResponse::decode(&payload).unwrap()
    }

    fn nq_connect(&self, key: PeerKey, session: &OpenSessionResponse) -> ResponseCode {
        self.send(
            key,
            &encode_request(CommandId::NqConnect, &NqConnectRequest {
                device_id: DeviceId::new(0),
                device_session_id: session.device_session_id,
                session_id: session.session_id,
                session_magic: session.session_magic,
            }),
        );
        self.expect_response(key).0
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
fn notifications_reach_the_attached_peer_key() {
    let running = Running::start();
    let commands = PeerKey::new(CLIENT_PID, 1);
    let notifications = PeerKey::new(CLIENT_PID, 2);
    running.open_device(commands);
    let session = running.open_session(commands);

    assert_eq!(running.nq_connect(notifications, &session), ResponseCode::Ok);

    running.send(
        commands,
        &encode_request(CommandId::Notify, &SessionRequest {
            session_id: session.session_id,
        }),
    );
    let (from, payload) = running.receive();
    assert_eq!(from, notifications);
    let notification = Notification::decode(&payload).unwrap();
    assert_eq!(notification.session_id, session.session_id);
    assert_eq!(notification.payload, 0);

    running.send(
        commands,
        &CommandHeader::new(CommandId::GetMobicoreVersion).encode(),
    );
    assert_eq!(running.expect_response(commands).0, ResponseCode::Ok);
}

#[test]
fn bound_key_cannot_carry_notifications() {
    let running = Running::start();
    let commands = PeerKey::new(CLIENT_PID, 1);
    running.open_device(commands);
    let session = running.open_session(commands);

    assert_eq!(running.nq_connect(commands, &session), ResponseCode::CommandNotAllowed);
    let attached = running.device.session(session.session_id).unwrap();
    assert!(!attached.has_notification_connection());
}

#[test]
fn exited_client_loses_its_sessions() {
    let running = Running::start();
    let commands = PeerKey::new(CLIENT_PID, 1);
    running.open_device(commands);
    let session = running.open_session(commands);
    assert_eq!(running.device.session_count(), 1);

    running.dead_pid.store(CLIENT_PID, Ordering::SeqCst);
    assert!(wait_until(|| running.device.session_count() == 0));
    assert_eq!(running.emulator.session_count(), 0);
    assert!(running.device.session(session.session_id).is_none());
    assert_eq!(running.context.bound_connections(), 0);
}
