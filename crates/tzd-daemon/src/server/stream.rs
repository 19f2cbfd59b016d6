//! Unix stream socket listener.

use std::fs;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use tracing::{debug, info, warn};

use super::{ConnectionHandler, ServerError, ServerResult};
use crate::connection::{Connection, SharedConnection, StreamConnection, poll_timeout};

/// Mode of a socket directory created by the listener.
const DIRECTORY_MODE: u32 = 0o700;

/// Settings of a [`StreamServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamServerConfig {
    /// Socket path.
    pub path: PathBuf,
    /// Permission bits applied after bind.
    pub mode: u32,
    /// Upper bound of one readiness wait; bounds shutdown latency.
    pub poll_interval: Duration,
}

/// Accepts client connections on a Unix stream socket.
pub struct StreamServer {
    config: StreamServerConfig,
    listener: UnixListener,
    connections: Vec<Arc<StreamConnection>>,
}

impl StreamServer {
    /// Binds the socket.
    ///
    /// Creates the parent directory (mode 0700) if it is missing and
    /// replaces a stale socket file. An existing path that is not a socket
    /// is never removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or socket cannot be prepared, or
    /// the bind fails.
    pub fn bind(config: StreamServerConfig) -> ServerResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }
        remove_stale_socket(&config.path)?;
        let listener = UnixListener::bind(&config.path).map_err(|source| ServerError::Bind {
            path: config.path.clone(),
            source,
        })?;
        fs::set_permissions(&config.path, fs::Permissions::from_mode(config.mode))?;
        info!(socket = %config.path.display(), mode = %format!("{:o}", config.mode), "stream listener bound");
        Ok(Self {
            config,
            listener,
            connections: Vec::new(),
        })
    }

    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Connections currently owned by the loop.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs the event loop until `shutdown` is set.
    ///
    /// Connections still open when the loop stops are dropped through the
    /// handler.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for readiness fails.
    pub fn run(
        &mut self,
        handler: &dyn ConnectionHandler,
        shutdown: &AtomicBool,
    ) -> ServerResult<()> {
        debug!(socket = %self.config.path.display(), "stream listener running");
        let result = self.serve(handler, shutdown);
        for connection in std::mem::take(&mut self.connections) {
            let shared: SharedConnection = connection;
            handler.drop_connection(&shared);
            shared.shutdown();
        }
        result
    }

    fn serve(&mut self, handler: &dyn ConnectionHandler, shutdown: &AtomicBool) -> ServerResult<()> {
        while !shutdown.load(Ordering::SeqCst) {
            let Some((accept, ready)) = self.wait_ready()? else {
                continue;
            };
            if accept {
                self.accept();
            }
            for connection in ready {
                self.dispatch(handler, connection);
            }
        }
        Ok(())
    }

    fn wait_ready(&self) -> ServerResult<Option<(bool, Vec<Arc<StreamConnection>>)>> {
        let interest = PollFlags::POLLIN;
        let mut fds = Vec::with_capacity(self.connections.len() + 1);
        fds.push(PollFd::new(self.listener.as_fd(), interest));
        fds.extend(
            self.connections
                .iter()
                .map(|connection| PollFd::new(connection.as_fd(), interest)),
        );
        match poll(&mut fds, poll_timeout(Some(self.config.poll_interval))) {
            Ok(0) | Err(Errno::EINTR) => return Ok(None),
            Ok(_) => {},
            Err(errno) => return Err(io::Error::from(errno).into()),
        }
        let readable = |fd: &PollFd<'_>| {
            fd.revents().is_some_and(|events| {
                events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            })
        };
        let accept = readable(&fds[0]);
        let ready = fds[1..]
            .iter()
            .zip(&self.connections)
            .filter(|(fd, _)| readable(fd))
            .map(|(_, connection)| Arc::clone(connection))
            .collect();
        Ok(Some((accept, ready)))
    }

    fn accept(&mut self) {
        match self.listener.accept() {
            Ok((stream, _)) => {
                let connection = Arc::new(StreamConnection::new(stream));
                debug!(connection = %connection.id(), peer = %connection.peer(), "client connected");
                self.connections.push(connection);
            },
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    fn dispatch(&mut self, handler: &dyn ConnectionHandler, connection: Arc<StreamConnection>) {
        let shared: SharedConnection = connection;
        if handler.handle_connection(&shared) {
            if shared.is_detached() {
                self.detach_connection(&shared);
            }
            return;
        }
        debug!(connection = %shared.id(), "dropping connection");
        self.detach_connection(&shared);
        handler.drop_connection(&shared);
        shared.shutdown();
    }

    /// Removes a connection from the loop without closing it.
    pub fn detach_connection(&mut self, connection: &SharedConnection) {
        let id = connection.id();
        self.connections.retain(|owned| owned.id() != id);
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        match fs::remove_file(&self.config.path) {
            Ok(()) => debug!(socket = %self.config.path.display(), "removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => warn!(socket = %self.config.path.display(), error = %e, "failed to remove socket file"),
        }
    }
}

fn ensure_directory(path: &Path) -> ServerResult<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => Err(ServerError::SocketPath {
            path: path.to_path_buf(),
            reason: "directory is a symlink".to_string(),
        }),
        Ok(metadata) if !metadata.is_dir() => Err(ServerError::SocketPath {
            path: path.to_path_buf(),
            reason: "exists but is not a directory".to_string(),
        }),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path)?;
            fs::set_permissions(path, fs::Permissions::from_mode(DIRECTORY_MODE))?;
            debug!(path = %path.display(), "created socket directory");
            Ok(())
        },
        Err(e) => Err(e.into()),
    }
}

fn remove_stale_socket(path: &Path) -> ServerResult<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            fs::remove_file(path)?;
            debug!(path = %path.display(), "removed stale socket file");
            Ok(())
        },
        Ok(_) => Err(ServerError::SocketPath {
            path: path.to_path_buf(),
            reason: "exists but is not a socket".to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use tempfile::TempDir;

    use super::*;

    fn config(dir: &TempDir) -> StreamServerConfig {
        StreamServerConfig {
            path: dir.path().join("run").join("tzd.sock"),
            mode: 0o660,
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn bind_sets_modes_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let path = config.path.clone();
        let server = StreamServer::bind(config).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o660);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, DIRECTORY_MODE);

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn stale_socket_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let first = StreamServer::bind(config.clone()).unwrap();
        std::mem::forget(first);
        let server = StreamServer::bind(config).unwrap();
        assert!(UnixStream::connect(server.path()).is_ok());
    }

    #[test]
    fn regular_file_is_not_removed() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        fs::create_dir_all(config.path.parent().unwrap()).unwrap();
        fs::write(&config.path, b"not a socket").unwrap();
        let err = StreamServer::bind(config.clone()).err().unwrap();
        assert!(matches!(err, ServerError::SocketPath { .. }));
        assert!(config.path.exists());
    }
}
