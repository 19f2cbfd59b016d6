//! Datagram connections multiplexed over one netlink socket.
//!
//! The kernel side of the client library talks to the daemon over a netlink
//! socket. Every datagram starts with a 16-byte [`DatagramHeader`]; the
//! sender's `(pid, seq)` pair identifies the logical connection
//! ([`PeerKey`]). The netlink listener owns the socket, routes each payload
//! to the matching [`DatagramConnection`] with
//! [`DatagramConnection::deliver`], and replies go out through the shared
//! socket addressed to the peer's pid.
//!
//! A connection holds one pending message: a reader asking for fewer bytes
//! than a datagram carried gets a prefix now and the rest on the next read.
//! Whatever a new datagram finds still pending is discarded, so trailing
//! bytes of one message never become the start of the next command.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use nix::libc;
use nix::sys::socket::{self, MsgFlags};
use tracing::warn;

use super::{Connection, ConnectionId, ReadOutcome};

/// Size of the datagram header.
pub const DATAGRAM_HEADER_SIZE: usize = 16;

/// Largest datagram the listener accepts.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Identity of a logical datagram connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    /// Sending process.
    pub pid: u32,
    /// Sender-chosen sequence number.
    pub seq: u32,
}

impl PeerKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(pid: u32, seq: u32) -> Self {
        Self { pid, seq }
    }

    /// The 64-bit key `(pid << 32) | seq`.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.pid as u64) << 32) | self.seq as u64
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "netlink:pid={},seq={}", self.pid, self.seq)
    }
}

/// Netlink-style datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Total datagram length including this header.
    pub len: u32,
    /// Message type.
    pub msg_type: u16,
    /// Message flags.
    pub flags: u16,
    /// Sender sequence number.
    pub seq: u32,
    /// Sender pid.
    pub pid: u32,
}

impl DatagramHeader {
    /// Message type used for daemon replies.
    pub const MSG_TYPE_DATA: u16 = 0x10;

    /// Parses the header at the front of `datagram`.
    ///
    /// Returns `None` if the datagram is shorter than a header or its
    /// length field is inconsistent.
    #[must_use]
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < DATAGRAM_HEADER_SIZE {
            return None;
        }
        let mut buf = &datagram[..DATAGRAM_HEADER_SIZE];
        let header = Self {
            len: buf.get_u32_le(),
            msg_type: buf.get_u16_le(),
            flags: buf.get_u16_le(),
            seq: buf.get_u32_le(),
            pid: buf.get_u32_le(),
        };
        let len = header.len as usize;
        if len < DATAGRAM_HEADER_SIZE || len > datagram.len() {
            return None;
        }
        Some(header)
    }

    /// The peer this datagram came from.
    #[must_use]
    pub const fn key(&self) -> PeerKey {
        PeerKey::new(self.pid, self.seq)
    }

    /// Builds a datagram carrying `payload`.
    #[must_use]
    pub fn frame(key: PeerKey, sender_pid: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DATAGRAM_HEADER_SIZE + payload.len());
        let len = u32::try_from(DATAGRAM_HEADER_SIZE + payload.len()).unwrap_or(u32::MAX);
        buf.put_u32_le(len);
        buf.put_u16_le(Self::MSG_TYPE_DATA);
        buf.put_u16_le(0);
        buf.put_u32_le(key.seq);
        buf.put_u32_le(sender_pid);
        buf.put_slice(payload);
        buf
    }
}

/// Whether a send may wait for room in the peer's receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Wait until the datagram is queued.
    Blocking,
    /// Fail with [`io::ErrorKind::WouldBlock`] when the peer's queue is full.
    NonBlocking,
}

impl SendMode {
    const fn flags(self) -> libc::c_int {
        match self {
            Self::Blocking => 0,
            Self::NonBlocking => libc::MSG_DONTWAIT,
        }
    }
}

/// A datagram socket shared by every [`DatagramConnection`] of a listener.
pub trait DatagramSocket: Send + Sync + fmt::Debug {
    /// Receives one datagram.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Sends one datagram to the process `pid`.
    fn send_to(&self, pid: u32, datagram: &[u8], mode: SendMode) -> io::Result<usize>;

    /// Descriptor the listener polls.
    fn as_fd(&self) -> BorrowedFd<'_>;

    /// Pid placed in outgoing headers.
    fn local_pid(&self) -> u32;
}

/// A bound `AF_NETLINK` datagram socket.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    local_pid: u32,
}

impl NetlinkSocket {
    /// Opens and binds a netlink socket for `protocol`, addressed by this
    /// process's pid.
    ///
    /// # Errors
    ///
    /// Returns the error from `socket(2)` or `bind(2)`.
    pub fn bind(protocol: i32) -> io::Result<Self> {
        // SAFETY: socket(2) takes no pointers; the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let local_pid = std::process::id();
        let addr = netlink_addr(local_pid);
        // SAFETY: `addr` is a valid sockaddr_nl that outlives the call and
        // the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&raw const addr).cast::<libc::sockaddr>(),
                socklen::<libc::sockaddr_nl>(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, local_pid })
    }
}

fn netlink_addr(pid: u32) -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::sa_family_t::try_from(libc::AF_NETLINK).unwrap_or_default();
    addr.nl_pid = pid;
    addr.nl_groups = 0;
    addr
}

fn socklen<T>() -> libc::socklen_t {
    libc::socklen_t::try_from(mem::size_of::<T>()).unwrap_or(libc::socklen_t::MAX)
}

impl DatagramSocket for NetlinkSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the pointer and length describe `buf`, which is valid
        // for writes for the duration of the call.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };
        usize::try_from(n).map_err(|_| io::Error::last_os_error())
    }

    fn send_to(&self, pid: u32, datagram: &[u8], mode: SendMode) -> io::Result<usize> {
        let addr = netlink_addr(pid);
        // SAFETY: `datagram` and `addr` are valid for reads for the
        // duration of the call and the lengths match.
        let n = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                datagram.as_ptr().cast::<libc::c_void>(),
                datagram.len(),
                mode.flags(),
                (&raw const addr).cast::<libc::sockaddr>(),
                socklen::<libc::sockaddr_nl>(),
            )
        };
        usize::try_from(n).map_err(|_| io::Error::last_os_error())
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn local_pid(&self) -> u32 {
        self.local_pid
    }
}

/// One end of a connected Unix datagram pair.
///
/// Carries the same framing as [`NetlinkSocket`] between two endpoints in
/// one process; the destination pid is only used inside headers.
#[derive(Debug)]
pub struct PairedDatagramSocket {
    socket: UnixDatagram,
    local_pid: u32,
}

impl PairedDatagramSocket {
    /// Creates a connected pair.
    ///
    /// # Errors
    ///
    /// Returns the error from `socketpair(2)`.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixDatagram::pair()?;
        let pid = std::process::id();
        Ok((
            Self {
                socket: a,
                local_pid: pid,
            },
            Self {
                socket: b,
                local_pid: pid,
            },
        ))
    }

    /// Sends a raw datagram to the other end.
    ///
    /// # Errors
    ///
    /// Returns the error from `send(2)`.
    pub fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send(datagram)
    }

    /// Sets a receive timeout.
    ///
    /// # Errors
    ///
    /// Returns the error from `setsockopt(2)`.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }
}

impl DatagramSocket for PairedDatagramSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn send_to(&self, _pid: u32, datagram: &[u8], mode: SendMode) -> io::Result<usize> {
        let flags = MsgFlags::from_bits_truncate(mode.flags());
        Ok(socket::send(self.socket.as_raw_fd(), datagram, flags)?)
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    fn local_pid(&self) -> u32 {
        self.local_pid
    }
}

#[derive(Debug, Default)]
struct Inbox {
    pending: BytesMut,
    closed: bool,
}

/// A logical connection identified by a [`PeerKey`].
pub struct DatagramConnection {
    id: ConnectionId,
    key: PeerKey,
    socket: Arc<dyn DatagramSocket>,
    inbox: Mutex<Inbox>,
    arrived: Condvar,
    detached: AtomicBool,
    nonblocking_writes: AtomicBool,
}

impl DatagramConnection {
    /// Creates the connection for `key` on `socket`.
    #[must_use]
    pub fn new(key: PeerKey, socket: Arc<dyn DatagramSocket>) -> Self {
        Self {
            id: ConnectionId::next(),
            key,
            socket,
            inbox: Mutex::new(Inbox::default()),
            arrived: Condvar::new(),
            detached: AtomicBool::new(false),
            nonblocking_writes: AtomicBool::new(false),
        }
    }

    /// The peer key.
    #[must_use]
    pub const fn key(&self) -> PeerKey {
        self.key
    }

    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the pending message with `payload` and wakes readers.
    pub fn deliver(&self, payload: &[u8]) {
        let mut inbox = self.inbox();
        if inbox.closed {
            return;
        }
        if !inbox.pending.is_empty() {
            warn!(
                peer = %self.key,
                discarded = inbox.pending.len(),
                "discarding unread bytes of the previous datagram"
            );
            inbox.pending.clear();
        }
        inbox.pending.extend_from_slice(payload);
        drop(inbox);
        self.arrived.notify_all();
    }

    /// Bytes received but not yet read.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inbox().pending.len()
    }

    fn wait_inbox(&self, timeout: Option<Duration>) -> MutexGuard<'_, Inbox> {
        let inbox = self.inbox();
        let not_ready = |inbox: &mut Inbox| inbox.pending.is_empty() && !inbox.closed;
        match timeout {
            Some(timeout) => {
                self.arrived
                    .wait_timeout_while(inbox, timeout, not_ready)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            },
            None => self
                .arrived
                .wait_while(inbox, not_ready)
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl fmt::Debug for DatagramConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("detached", &self.is_detached())
            .finish_non_exhaustive()
    }
}

impl Connection for DatagramConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }
        let mut inbox = self.wait_inbox(timeout);
        if inbox.pending.is_empty() {
            return Ok(if inbox.closed {
                ReadOutcome::Closed
            } else {
                ReadOutcome::TimedOut
            });
        }
        let n = buf.len().min(inbox.pending.len());
        buf[..n].copy_from_slice(&inbox.pending[..n]);
        inbox.pending.advance(n);
        Ok(ReadOutcome::Data(n))
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let datagram = DatagramHeader::frame(self.key, self.socket.local_pid(), buf);
        let mode = if self.nonblocking_writes.load(Ordering::Acquire) {
            SendMode::NonBlocking
        } else {
            SendMode::Blocking
        };
        let sent = self.socket.send_to(self.key.pid, &datagram, mode)?;
        Ok(sent.saturating_sub(DATAGRAM_HEADER_SIZE))
    }

    /// Datagrams are queued whole or not at all, so any bound turns the
    /// shared socket's sends for this peer non-blocking.
    fn set_write_timeout(&self, _timeout: Duration) -> io::Result<()> {
        self.nonblocking_writes.store(true, Ordering::Release);
        Ok(())
    }

    fn wait_for_data(&self, timeout: Option<Duration>) -> io::Result<bool> {
        Ok(!self.wait_inbox(timeout).pending.is_empty())
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.inbox().closed = true;
        self.arrived.notify_all();
    }

    fn peer(&self) -> String {
        self.key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (DatagramConnection, PairedDatagramSocket) {
        let (daemon, client) = PairedDatagramSocket::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let connection = DatagramConnection::new(PeerKey::new(4321, 7), Arc::new(daemon));
        (connection, client)
    }

    #[test]
    fn peer_key_packing() {
        let key = PeerKey::new(0x0000_1234, 0x0000_0005);
        assert_eq!(key.as_u64(), 0x0000_1234_0000_0005);
        assert_ne!(PeerKey::new(1, 2).as_u64(), PeerKey::new(2, 1).as_u64());
    }

    #[test]
    fn header_parse_rejects_bad_lengths() {
        let framed = DatagramHeader::frame(PeerKey::new(1, 2), 1, b"abcd");
        let header = DatagramHeader::parse(&framed).unwrap();
        assert_eq!(header.len, 20);
        assert_eq!(header.key(), PeerKey::new(1, 2));

        assert!(DatagramHeader::parse(&framed[..10]).is_none());
        assert!(DatagramHeader::parse(&framed[..18]).is_none());
    }

    #[test]
    fn partial_read_keeps_remainder() {
        let (connection, _client) = connection();
        connection.deliver(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut head = [0u8; 4];
        assert_eq!(
            connection.read(&mut head, Some(Duration::ZERO)).unwrap(),
            ReadOutcome::Data(4)
        );
        assert_eq!(head, [1, 2, 3, 4]);
        assert_eq!(connection.pending_len(), 4);

        let mut tail = [0u8; 16];
        assert_eq!(
            connection.read(&mut tail, Some(Duration::ZERO)).unwrap(),
            ReadOutcome::Data(4)
        );
        assert_eq!(&tail[..4], &[5, 6, 7, 8]);
        assert_eq!(
            connection
                .read(&mut tail, Some(Duration::from_millis(5)))
                .unwrap(),
            ReadOutcome::TimedOut
        );
    }

    #[test]
    fn new_datagram_discards_unread_tail() {
        let (connection, _client) = connection();
        connection.deliver(&[1, 2, 3, 4]);
        let mut head = [0u8; 2];
        connection.read(&mut head, None).unwrap();
        assert_eq!(head, [1, 2]);

        connection.deliver(&[9]);
        assert_eq!(connection.pending_len(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(
            connection.read(&mut buf, None).unwrap(),
            ReadOutcome::Data(1)
        );
        assert_eq!(buf[0], 9);
    }

    #[test]
    fn bounded_writes_fail_instead_of_blocking() {
        let (connection, _client) = connection();
        connection
            .set_write_timeout(Duration::from_millis(10))
            .unwrap();
        let err = loop {
            if let Err(e) = connection.write(&[0u8; 512]) {
                break e;
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn reader_wakes_on_delivery() {
        let (connection, _client) = connection();
        let connection = Arc::new(connection);
        let reader = {
            let connection = Arc::clone(&connection);
            std::thread::spawn(move || {
                let mut buf = [0u8; 2];
                let outcome = connection.read(&mut buf, Some(Duration::from_secs(5)));
                (outcome.unwrap(), buf)
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        connection.deliver(&[9, 9]);
        let (outcome, buf) = reader.join().unwrap();
        assert_eq!(outcome, ReadOutcome::Data(2));
        assert_eq!(buf, [9, 9]);
    }

    #[test]
    fn write_frames_reply() {
        let (connection, client) = connection();
        assert_eq!(connection.write(b"resp").unwrap(), 4);

        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        let header = DatagramHeader::parse(&buf[..n]).unwrap();
        assert_eq!(header.seq, 7);
        assert_eq!(header.len as usize, n);
        assert_eq!(&buf[DATAGRAM_HEADER_SIZE..n], b"resp");
    }

    #[test]
    fn shutdown_reports_closed() {
        let (connection, _client) = connection();
        connection.shutdown();
        let mut buf = [0u8; 1];
        assert_eq!(
            connection.read(&mut buf, None).unwrap(),
            ReadOutcome::Closed
        );
        connection.deliver(&[1]);
        assert_eq!(connection.pending_len(), 0);
    }
}
