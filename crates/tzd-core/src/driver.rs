//! Kernel-driver collaborator.
//!
//! The daemon never touches secure-world hardware directly. Memory
//! registration, fast calls into the monitor and the secure-side interrupt
//! all go through a [`KernelDriver`]. The trait mirrors the operations a
//! TrustZone kernel module exposes; the in-process
//! [`MonitorEmulator`](crate::emulator::MonitorEmulator) implements it for
//! development and tests.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::mailbox::{MailboxLayout, SharedWords};
use crate::types::{SharedBuffer, WsmHandle};

/// State of the secure monitor as reported by `fc_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    /// `fc_init` has not completed.
    NotInitialized,
    /// Running and processing commands.
    Initialized,
    /// Crashed or stopped; will never answer again.
    Halted,
}

/// Result of a status fast call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorInfo {
    /// Current status.
    pub status: MonitorStatus,
    /// Implementation-defined extended status word.
    pub ext_info: u32,
}

/// Outcome of waiting for the secure-side interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The interrupt fired.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
}

/// Kernel-driver errors.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No registration with this handle.
    #[error("world-shared memory {0} not found")]
    NotFound(WsmHandle),

    /// The allocation could not be satisfied.
    #[error("cannot allocate {len} bytes of world-shared memory")]
    OutOfMemory {
        /// Requested length.
        len: usize,
    },

    /// The call is not valid in the current state.
    #[error("{call} rejected: {reason}")]
    Rejected {
        /// Operation name.
        call: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// I/O error talking to the kernel module.
    #[error("kernel driver I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Operations the daemon needs from the kernel module.
pub trait KernelDriver: Send + Sync {
    /// Maps a mailbox region of at least `words` words.
    fn map_mailbox(&self, words: usize) -> DriverResult<Arc<dyn SharedWords>>;

    /// Allocates contiguous world-shared memory.
    fn alloc_wsm(&self, len: usize) -> DriverResult<SharedBuffer>;

    /// Frees memory from [`KernelDriver::alloc_wsm`].
    fn free_wsm(&self, handle: WsmHandle) -> DriverResult<()>;

    /// Registers an existing normal-world buffer and builds its page table.
    fn register_wsm(&self, virt_addr: usize, len: usize) -> DriverResult<SharedBuffer>;

    /// Drops a registration from [`KernelDriver::register_wsm`].
    fn unregister_wsm(&self, handle: WsmHandle) -> DriverResult<()>;

    /// Pins a buffer so it survives its owner closing the handle.
    fn lock_wsm(&self, handle: WsmHandle) -> DriverResult<()>;

    /// Releases a pin taken by [`KernelDriver::lock_wsm`].
    fn unlock_wsm(&self, handle: WsmHandle) -> DriverResult<()>;

    /// Looks up a registration by handle.
    fn find_wsm(&self, handle: WsmHandle) -> DriverResult<SharedBuffer>;

    /// Frees registrations whose owners are gone.
    fn clean_orphans(&self) -> DriverResult<()>;

    /// Hands the mailbox layout to the monitor.
    fn fc_init(&self, layout: &MailboxLayout) -> DriverResult<()>;

    /// Gives the secure world a time slice.
    fn fc_yield(&self) -> DriverResult<()>;

    /// Raises the normal-to-secure interrupt.
    fn fc_nsiq(&self) -> DriverResult<()>;

    /// Queries the monitor status.
    fn fc_info(&self) -> DriverResult<MonitorInfo>;

    /// Waits for the secure-to-normal interrupt.
    fn wait_ssiq(&self, timeout: Duration) -> DriverResult<WaitOutcome>;
}
