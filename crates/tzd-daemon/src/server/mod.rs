//! Listener event loops.
//!
//! Each transport runs one single-threaded loop that waits on its listening
//! descriptor and on every connection it owns, then hands readable
//! connections to a [`ConnectionHandler`]. Loops never spawn a thread per
//! connection.
//!
//! # Invariants
//!
//! - A connection the handler rejects is dropped: the handler is told via
//!   [`ConnectionHandler::drop_connection`] and the transport is shut down.
//! - A connection the handler detached leaves the loop's bookkeeping without
//!   being closed; its owner (a session) is responsible for it from then on.

mod netlink;
mod stream;

use std::io;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use thiserror::Error;

pub use self::netlink::{LivenessCheck, NetlinkServer, NetlinkServerConfig, process_alive};
pub use self::stream::{StreamServer, StreamServerConfig};
use crate::connection::SharedConnection;

/// Processes commands arriving on connections.
pub trait ConnectionHandler: Send + Sync {
    /// Handles one readable connection.
    ///
    /// Returns `false` if the connection must be dropped.
    fn handle_connection(&self, connection: &SharedConnection) -> bool;

    /// Releases everything bound to a connection that is going away.
    fn drop_connection(&self, connection: &SharedConnection);
}

/// Listener errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The socket path is unusable.
    #[error("socket path {path}: {reason}")]
    SocketPath {
        /// Offending path.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// Binding the listener failed.
    #[error("failed to bind {path}: {source}")]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// I/O error in the event loop.
    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for listener operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Runs `body` on a named listener thread.
///
/// # Errors
///
/// Returns the error from spawning the thread.
pub fn spawn_listener<F>(name: &str, body: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(body)
}
