//! Netlink datagram listener.
//!
//! One shared socket carries every logical datagram connection. The loop
//! demultiplexes by [`PeerKey`], creating a [`DatagramConnection`] the first
//! time a key is seen, and periodically reaps connections whose sending
//! process no longer exists.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use super::{ConnectionHandler, ServerResult};
use crate::connection::{
    Connection, DATAGRAM_HEADER_SIZE, DatagramConnection, DatagramHeader, DatagramSocket,
    MAX_DATAGRAM_SIZE, PeerKey, SharedConnection, poll_readable,
};

/// Decides whether the process `pid` is still alive.
pub type LivenessCheck = Box<dyn Fn(u32) -> bool + Send + Sync>;

/// Checks `pid` with signal 0.
///
/// Only `ESRCH` counts as dead; a permission error means the process exists.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

/// Settings of a [`NetlinkServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetlinkServerConfig {
    /// Upper bound of one readiness wait.
    pub poll_interval: Duration,
    /// Interval between liveness sweeps.
    pub reap_interval: Duration,
}

/// Serves datagram connections multiplexed over one socket.
pub struct NetlinkServer {
    config: NetlinkServerConfig,
    socket: Arc<dyn DatagramSocket>,
    connections: HashMap<u64, Arc<DatagramConnection>>,
    liveness: LivenessCheck,
    last_reap: Instant,
}

impl NetlinkServer {
    /// Creates a listener on `socket` probing peers with [`process_alive`].
    #[must_use]
    pub fn new(config: NetlinkServerConfig, socket: Arc<dyn DatagramSocket>) -> Self {
        Self::with_liveness_check(config, socket, Box::new(process_alive))
    }

    /// Creates a listener with a custom liveness check.
    #[must_use]
    pub fn with_liveness_check(
        config: NetlinkServerConfig,
        socket: Arc<dyn DatagramSocket>,
        liveness: LivenessCheck,
    ) -> Self {
        Self {
            config,
            socket,
            connections: HashMap::new(),
            liveness,
            last_reap: Instant::now(),
        }
    }

    /// Logical connections currently owned by the loop.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Looks up the connection of `key`.
    #[must_use]
    pub fn connection(&self, key: PeerKey) -> Option<Arc<DatagramConnection>> {
        self.connections.get(&key.as_u64()).cloned()
    }

    /// Runs the event loop until `shutdown` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails.
    pub fn run(
        &mut self,
        handler: &dyn ConnectionHandler,
        shutdown: &AtomicBool,
    ) -> ServerResult<()> {
        debug!(local_pid = self.socket.local_pid(), "netlink listener running");
        let result = self.serve(handler, shutdown);
        for (_, connection) in self.connections.drain() {
            let shared: SharedConnection = connection;
            handler.drop_connection(&shared);
            shared.shutdown();
        }
        result
    }

    fn serve(&mut self, handler: &dyn ConnectionHandler, shutdown: &AtomicBool) -> ServerResult<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while !shutdown.load(Ordering::SeqCst) {
            if poll_readable(self.socket.as_fd(), Some(self.config.poll_interval))? {
                self.receive_one(handler, &mut buf)?;
            }
            if self.last_reap.elapsed() >= self.config.reap_interval {
                self.reap(handler);
                self.last_reap = Instant::now();
            }
        }
        Ok(())
    }

    /// Receives one datagram and dispatches it.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails.
    pub fn receive_one(&mut self, handler: &dyn ConnectionHandler, buf: &mut [u8]) -> ServerResult<()> {
        let len = match self.socket.recv(buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        };
        let datagram = &buf[..len];
        let Some(header) = DatagramHeader::parse(datagram) else {
            warn!(len, "discarding malformed datagram");
            return Ok(());
        };
        let key = header.key();
        let payload = &datagram[DATAGRAM_HEADER_SIZE..header.len as usize];
        let connection = Arc::clone(self.connections.entry(key.as_u64()).or_insert_with(|| {
            debug!(peer = %key, "new datagram peer");
            Arc::new(DatagramConnection::new(key, Arc::clone(&self.socket)))
        }));
        trace!(peer = %key, len = payload.len(), "datagram received");
        connection.deliver(payload);
        self.dispatch(handler, connection);
        Ok(())
    }

    fn dispatch(&mut self, handler: &dyn ConnectionHandler, connection: Arc<DatagramConnection>) {
        let key = connection.key();
        let shared: SharedConnection = connection;
        if handler.handle_connection(&shared) {
            if shared.is_detached() {
                self.detach_connection(key);
            }
            return;
        }
        debug!(peer = %key, "dropping datagram connection");
        self.detach_connection(key);
        handler.drop_connection(&shared);
        shared.shutdown();
    }

    /// Removes a connection from the loop without closing it.
    pub fn detach_connection(&mut self, key: PeerKey) -> Option<Arc<DatagramConnection>> {
        self.connections.remove(&key.as_u64())
    }

    /// Drops every connection whose peer process has exited.
    ///
    /// Returns the number of connections reaped.
    pub fn reap(&mut self, handler: &dyn ConnectionHandler) -> usize {
        let dead: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, connection)| !(self.liveness)(connection.key().pid))
            .map(|(key, _)| *key)
            .collect();
        for key in &dead {
            if let Some(connection) = self.connections.remove(key) {
                debug!(peer = %connection.key(), "reaping connection of exited process");
                let shared: SharedConnection = connection;
                handler.drop_connection(&shared);
                shared.shutdown();
            }
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::connection::{PairedDatagramSocket, ReadOutcome};

    #[derive(Default)]
    struct Echo {
        dropped: Mutex<Vec<u64>>,
        detach_next: AtomicBool,
    }

    impl ConnectionHandler for Echo {
        fn handle_connection(&self, connection: &SharedConnection) -> bool {
            let mut buf = [0u8; 64];
            match connection.read(&mut buf, Some(Duration::from_millis(10))) {
                Ok(ReadOutcome::Data(n)) => {
                    if buf[..n] == *b"bye" {
                        return false;
                    }
                    if self.detach_next.swap(false, Ordering::SeqCst) {
                        connection.detach();
                    }
                    connection.write(&buf[..n]).is_ok()
                },
                _ => false,
            }
        }

        fn drop_connection(&self, connection: &SharedConnection) {
            self.dropped.lock().unwrap().push(connection.id().as_u64());
        }
    }

    fn config() -> NetlinkServerConfig {
        NetlinkServerConfig {
            poll_interval: Duration::from_millis(10),
            reap_interval: Duration::from_secs(60),
        }
    }

    fn server_with(liveness: LivenessCheck) -> (NetlinkServer, PairedDatagramSocket) {
        let (daemon, client) = PairedDatagramSocket::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let server = NetlinkServer::with_liveness_check(config(), Arc::new(daemon), liveness);
        (server, client)
    }

    fn send(client: &PairedDatagramSocket, key: PeerKey, payload: &[u8]) {
        client
            .send(&DatagramHeader::frame(key, key.pid, payload))
            .unwrap();
    }

    fn receive(server: &mut NetlinkServer, handler: &Echo) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        server.receive_one(handler, &mut buf).unwrap();
    }

    #[test]
    fn peers_are_demultiplexed_by_key() {
        let (mut server, client) = server_with(Box::new(|_| true));
        let handler = Echo::default();
        let a = PeerKey::new(100, 1);
        let b = PeerKey::new(100, 2);

        send(&client, a, b"one");
        receive(&mut server, &handler);
        send(&client, b, b"two");
        receive(&mut server, &handler);
        send(&client, a, b"three");
        receive(&mut server, &handler);

        assert_eq!(server.connection_count(), 2);
        let mut reply = [0u8; 64];
        let n = client.recv(&mut reply).unwrap();
        let header = DatagramHeader::parse(&reply[..n]).unwrap();
        assert_eq!(header.seq, 1);
        assert_eq!(&reply[DATAGRAM_HEADER_SIZE..n], b"one");
    }

    #[test]
    fn rejected_connection_is_dropped() {
        let (mut server, client) = server_with(Box::new(|_| true));
        let handler = Echo::default();
        let key = PeerKey::new(7, 7);
        send(&client, key, b"hello");
        receive(&mut server, &handler);
        let id = server.connection(key).unwrap().id().as_u64();
        send(&client, key, b"bye");
        receive(&mut server, &handler);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(*handler.dropped.lock().unwrap(), vec![id]);
    }

    #[test]
    fn detached_connection_leaves_the_loop_open() {
        let (mut server, client) = server_with(Box::new(|_| true));
        let handler = Echo::default();
        handler.detach_next.store(true, Ordering::SeqCst);
        let key = PeerKey::new(9, 1);
        send(&client, key, b"attach");
        receive(&mut server, &handler);
        assert_eq!(server.connection_count(), 0);
        assert!(handler.dropped.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_datagram_is_ignored() {
        let (mut server, client) = server_with(Box::new(|_| true));
        let handler = Echo::default();
        client.send(&[1, 2, 3]).unwrap();
        receive(&mut server, &handler);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn dead_peers_are_reaped() {
        let dead_pid = Arc::new(AtomicU32::new(0));
        let dead = Arc::clone(&dead_pid);
        let (mut server, client) =
            server_with(Box::new(move |pid| pid != dead.load(Ordering::SeqCst)));
        let handler = Echo::default();
        send(&client, PeerKey::new(200, 1), b"a");
        receive(&mut server, &handler);
        send(&client, PeerKey::new(300, 1), b"b");
        receive(&mut server, &handler);

        assert_eq!(server.reap(&handler), 0);
        dead_pid.store(200, Ordering::SeqCst);
        assert_eq!(server.reap(&handler), 1);
        assert_eq!(server.connection_count(), 1);
        assert!(server.connection(PeerKey::new(300, 1)).is_some());
        assert_eq!(handler.dropped.lock().unwrap().len(), 1);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
