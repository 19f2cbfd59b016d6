//! Client connections.
//!
//! A [`Connection`] is a bidirectional byte channel to one client. Two
//! transports exist:
//!
//! - [`StreamConnection`]: a Unix stream socket accepted by the stream
//!   listener
//! - [`DatagramConnection`]: a logical connection demultiplexed out of a
//!   shared netlink datagram socket by the netlink listener
//!
//! Connections are shared as [`SharedConnection`] (`Arc<dyn Connection>`).
//! The listener that accepted a connection owns it until the connection is
//! [detached](Connection::detach); a detached connection has been handed to a
//! trustlet session as its notification channel and the listener stops
//! reading from it without closing it.

pub mod datagram;
pub mod stream;

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;

pub use self::datagram::{
    DATAGRAM_HEADER_SIZE, DatagramConnection, DatagramHeader, DatagramSocket, MAX_DATAGRAM_SIZE,
    NetlinkSocket, PairedDatagramSocket, PeerKey, SendMode,
};
pub use self::stream::StreamConnection;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Outcome of a bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes were read.
    Data(usize),
    /// The peer closed the connection.
    Closed,
    /// Nothing arrived before the timeout.
    TimedOut,
}

/// Connection-level errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// A bounded read did not complete in time.
    #[error("read timed out after {elapsed_ms} ms")]
    TimedOut {
        /// Time waited.
        elapsed_ms: u64,
    },

    /// Transport error.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// A bidirectional byte channel to one client.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Identifier used in logs and bookkeeping.
    fn id(&self) -> ConnectionId;

    /// Reads up to `buf.len()` bytes.
    ///
    /// `None` waits indefinitely; `Some(t)` returns
    /// [`ReadOutcome::TimedOut`] if nothing arrives within `t`.
    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<ReadOutcome>;

    /// Writes all of `buf`, returning the number of bytes written.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Bounds how long a single [`Connection::write`] may block.
    ///
    /// A write that cannot complete in time fails with
    /// [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::TimedOut`].
    fn set_write_timeout(&self, timeout: Duration) -> io::Result<()>;

    /// Waits until data is available; returns `false` on timeout.
    fn wait_for_data(&self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Marks the connection as taken over by a session.
    fn detach(&self);

    /// Whether [`Connection::detach`] was called.
    fn is_detached(&self) -> bool;

    /// Closes the transport; further reads report [`ReadOutcome::Closed`].
    fn shutdown(&self);

    /// Human-readable peer description.
    fn peer(&self) -> String;
}

/// A connection shared between a listener and the sessions using it.
pub type SharedConnection = Arc<dyn Connection>;

/// Fills `buf` completely, bounding the whole read by `timeout`.
///
/// # Errors
///
/// Returns [`ConnectionError::Closed`] if the peer closes first and
/// [`ConnectionError::TimedOut`] if the deadline passes.
pub fn read_exact(
    connection: &dyn Connection,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> ConnectionResult<()> {
    let started = Instant::now();
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = match timeout {
            Some(limit) => match limit.checked_sub(started.elapsed()) {
                Some(left) if !left.is_zero() => Some(left),
                _ => return Err(timed_out(started)),
            },
            None => None,
        };
        match connection.read(&mut buf[filled..], remaining)? {
            ReadOutcome::Data(n) => filled += n,
            ReadOutcome::Closed => return Err(ConnectionError::Closed),
            ReadOutcome::TimedOut => return Err(timed_out(started)),
        }
    }
    Ok(())
}

/// Writes all of `buf`.
///
/// # Errors
///
/// Returns the transport error, or [`ConnectionError::Closed`] on a short
/// write.
pub fn write_all(connection: &dyn Connection, buf: &[u8]) -> ConnectionResult<()> {
    let written = connection.write(buf)?;
    if written < buf.len() {
        return Err(ConnectionError::Closed);
    }
    Ok(())
}

fn timed_out(started: Instant) -> ConnectionError {
    ConnectionError::TimedOut {
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

/// Converts an optional duration into a poll timeout, saturating at the
/// largest finite value.
pub(crate) fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    timeout.map_or(PollTimeout::NONE, |t| {
        let millis = u16::try_from(t.as_millis()).unwrap_or(u16::MAX);
        PollTimeout::from(millis)
    })
}

/// Waits until `fd` is readable (or hung up).
///
/// Returns `false` on timeout or when interrupted by a signal.
pub(crate) fn poll_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, poll_timeout(timeout)) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(true),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn poll_timeout_saturates() {
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
        assert_eq!(
            poll_timeout(Some(Duration::from_secs(3600))),
            PollTimeout::from(u16::MAX)
        );
    }

    #[test]
    fn read_exact_spans_partial_writes() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = StreamConnection::new(server);
        let writer = std::thread::spawn(move || {
            use std::io::Write;
            let mut client = client;
            client.write_all(&[1, 2]).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            client.write_all(&[3, 4]).unwrap();
            client
        });
        let mut buf = [0u8; 4];
        read_exact(&server, &mut buf, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        drop(writer.join().unwrap());
    }

    #[test]
    fn read_exact_times_out() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = StreamConnection::new(server);
        {
            use std::io::Write;
            (&client).write_all(&[1]).unwrap();
        }
        let mut buf = [0u8; 4];
        let err = read_exact(&server, &mut buf, Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, ConnectionError::TimedOut { .. }));
    }

    #[test]
    fn read_exact_reports_close() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = StreamConnection::new(server);
        drop(client);
        let mut buf = [0u8; 4];
        let err = read_exact(&server, &mut buf, None).unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }
}
