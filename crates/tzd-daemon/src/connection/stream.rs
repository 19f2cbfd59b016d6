//! Unix stream socket connections.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use nix::sys::socket::{getsockopt, setsockopt, sockopt};
use nix::sys::time::{TimeVal, TimeValLike};

use super::{Connection, ConnectionId, ReadOutcome, poll_readable};

/// A connection over a Unix stream socket.
pub struct StreamConnection {
    id: ConnectionId,
    stream: UnixStream,
    peer_pid: Option<i32>,
    write_lock: Mutex<()>,
    detached: AtomicBool,
}

impl StreamConnection {
    /// Wraps an accepted (or connected) stream.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        let peer_pid = getsockopt(&stream, sockopt::PeerCredentials)
            .ok()
            .map(|creds| creds.pid());
        Self {
            id: ConnectionId::next(),
            stream,
            peer_pid,
            write_lock: Mutex::new(()),
            detached: AtomicBool::new(false),
        }
    }

    /// Connects to a listening socket.
    ///
    /// # Errors
    ///
    /// Returns the error from `connect(2)`.
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        UnixStream::connect(path).map(Self::new)
    }

    /// Process id of the peer, when the kernel reports it.
    #[must_use]
    pub const fn peer_pid(&self) -> Option<i32> {
        self.peer_pid
    }
}

impl AsFd for StreamConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .field("peer_pid", &self.peer_pid)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Connection for StreamConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }
        if timeout.is_some() && !poll_readable(self.stream.as_fd(), timeout)? {
            return Ok(ReadOutcome::TimedOut);
        }
        loop {
            match (&self.stream).read(buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    return Ok(ReadOutcome::Closed);
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        (&self.stream).write_all(buf)?;
        Ok(buf.len())
    }

    fn set_write_timeout(&self, timeout: Duration) -> io::Result<()> {
        // A zero SO_SNDTIMEO means "block forever".
        let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX).max(1);
        setsockopt(&self.stream, sockopt::SendTimeout, &TimeVal::milliseconds(millis))?;
        Ok(())
    }

    fn wait_for_data(&self, timeout: Option<Duration>) -> io::Result<bool> {
        poll_readable(self.stream.as_fd(), timeout)
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        // ENOTCONN after the peer already left is expected.
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer(&self) -> String {
        self.peer_pid
            .map_or_else(|| "unix:unknown".to_string(), |pid| format!("unix:pid={pid}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_with_timeout_and_data() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = StreamConnection::new(server);
        let mut buf = [0u8; 8];
        assert_eq!(
            server
                .read(&mut buf, Some(Duration::from_millis(10)))
                .unwrap(),
            ReadOutcome::TimedOut
        );

        (&client).write_all(b"abc").unwrap();
        assert_eq!(
            server.read(&mut buf, Some(Duration::from_secs(1))).unwrap(),
            ReadOutcome::Data(3)
        );
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn write_reaches_peer() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = StreamConnection::new(server);
        assert_eq!(server.write(b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        (&client).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_to_stalled_peer_times_out() {
        let (_client, server) = UnixStream::pair().unwrap();
        let server = StreamConnection::new(server);
        server.set_write_timeout(Duration::from_millis(50)).unwrap();

        let chunk = [0u8; 4096];
        let err = loop {
            if let Err(e) = server.write(&chunk) {
                break e;
            }
        };
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn detach_and_shutdown() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = StreamConnection::new(server);
        assert!(!server.is_detached());
        server.detach();
        assert!(server.is_detached());

        server.shutdown();
        let mut buf = [0u8; 1];
        assert_eq!((&client).read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peer_pid_is_ours() {
        let (_client, server) = UnixStream::pair().unwrap();
        let server = StreamConnection::new(server);
        let pid = i32::try_from(std::process::id()).unwrap();
        assert_eq!(server.peer_pid(), Some(pid));
        assert!(server.peer().contains(&pid.to_string()));
    }
}
