//! MCP control channel to the secure monitor.
//!
//! The monitor processes one MCP command at a time through a single shared
//! buffer, so the channel serialises transactions with a protocol lock held
//! from writing the command until the reply has been read.
//!
//! # Timeouts and faults
//!
//! A reply wait is bounded. When it times out the channel asks the monitor
//! for its status: a halted monitor faults the channel at once; a running
//! one gets another wait, up to the configured number of timeouts. A reply
//! that does not answer the command that was sent is protocol corruption
//! and faults the channel as well.
//!
//! Once faulted, the channel is permanently unusable: waiters are woken and
//! every current and future transaction fails with
//! [`DeviceError::Unreachable`] without touching the mailbox.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error, warn};
use tzd_core::Notification;
use tzd_core::SID_MCP;
use tzd_core::driver::{KernelDriver, MonitorStatus};
use tzd_core::mailbox::Mailbox;
use tzd_core::mcp::{McpCommand, McpResponse};

use super::{DeviceError, DeviceResult};

/// Timeout policy of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McpChannelConfig {
    /// Bound on a single reply wait.
    pub timeout: Duration,
    /// Consecutive timeouts tolerated while the monitor reports itself
    /// running.
    pub max_timeouts: u32,
}

impl Default for McpChannelConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_timeouts: 3,
        }
    }
}

/// Outcome of a reply wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The monitor signalled a reply.
    Replied,
    /// The timeout elapsed.
    TimedOut,
    /// The channel faulted while waiting.
    Cancelled,
}

/// Snapshot of the channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    /// Transactions started.
    pub transactions: u64,
    /// Reply waits that timed out.
    pub timeouts: u64,
    /// Highest number of transactions observed in flight at once.
    pub max_in_flight: u32,
}

#[derive(Debug, Default)]
struct Counters {
    transactions: AtomicU64,
    timeouts: AtomicU64,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.transactions.fetch_add(1, Ordering::Relaxed);
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct ReplyState {
    pending: bool,
    cancelled: bool,
}

/// Serialised request/response channel over the MCP buffer.
#[derive(Debug)]
pub struct McpChannel {
    config: McpChannelConfig,
    protocol: Mutex<()>,
    reply: Mutex<ReplyState>,
    replied: Condvar,
    faulted: AtomicBool,
    counters: Counters,
}

impl McpChannel {
    /// Creates an idle channel.
    #[must_use]
    pub fn new(config: McpChannelConfig) -> Self {
        Self {
            config,
            protocol: Mutex::new(()),
            reply: Mutex::new(ReplyState::default()),
            replied: Condvar::new(),
            faulted: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Whether the channel is faulted.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Faults the channel and wakes every waiter.
    pub fn fault(&self) {
        if !self.faulted.swap(true, Ordering::SeqCst) {
            error!("secure monitor declared unreachable");
        }
        let mut reply = self.reply.lock().unwrap_or_else(PoisonError::into_inner);
        reply.cancelled = true;
        drop(reply);
        self.replied.notify_all();
    }

    /// Records that the monitor published a reply.
    pub fn signal_reply(&self) {
        let mut reply = self.reply.lock().unwrap_or_else(PoisonError::into_inner);
        reply.pending = true;
        drop(reply);
        self.replied.notify_all();
    }

    fn clear_reply(&self) {
        self.reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending = false;
    }

    /// Waits for [`McpChannel::signal_reply`], at most `timeout`.
    ///
    /// A signal that arrived before the call is not lost.
    pub fn wait_for_reply(&self, timeout: Duration) -> WaitResult {
        let reply = self.reply.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut reply, _) = self
            .replied
            .wait_timeout_while(reply, timeout, |state| !state.pending && !state.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        if reply.cancelled {
            WaitResult::Cancelled
        } else if reply.pending {
            reply.pending = false;
            WaitResult::Replied
        } else {
            WaitResult::TimedOut
        }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> ProtocolStats {
        ProtocolStats {
            transactions: self.counters.transactions.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            max_in_flight: self.counters.max_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Sends `command` and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::Unreachable`] if the channel is or becomes faulted
    /// - [`DeviceError::Rejected`] if the monitor answers with a failure
    /// - [`DeviceError::Mailbox`] / [`DeviceError::Driver`] if the command
    ///   cannot be submitted
    pub fn transact(
        &self,
        mailbox: &Mailbox,
        driver: &dyn KernelDriver,
        command: &McpCommand,
    ) -> DeviceResult<McpResponse> {
        if self.is_faulted() {
            return Err(DeviceError::Unreachable);
        }
        let _protocol = self.protocol.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_faulted() {
            return Err(DeviceError::Unreachable);
        }
        let _in_flight = InFlight::enter(&self.counters);
        let id = command.id();
        debug!(command = %id, "MCP transaction");

        self.clear_reply();
        mailbox.mcp().write(&command.encode())?;
        if !mailbox.outbound().put(Notification::new(SID_MCP, 0)) {
            warn!(command = %id, "notification queue full, MCP signal dropped");
        }
        driver.fc_nsiq()?;

        self.await_reply(driver)?;

        let response = match McpResponse::decode(&mailbox.mcp().read()) {
            Ok(response) => response,
            Err(e) => {
                error!(command = %id, error = %e, "malformed MCP reply");
                self.fault();
                return Err(DeviceError::Unreachable);
            },
        };
        if response.id != id {
            error!(command = %id, reply = %response.id, "MCP reply does not match command");
            self.fault();
            return Err(DeviceError::Unreachable);
        }
        if !response.result.is_ok() {
            debug!(command = %id, result = %response.result, "MCP command failed");
            return Err(DeviceError::Rejected {
                command: id,
                result: response.result,
            });
        }
        Ok(response)
    }

    fn await_reply(&self, driver: &dyn KernelDriver) -> DeviceResult<()> {
        let mut timeouts = 0;
        loop {
            match self.wait_for_reply(self.config.timeout) {
                WaitResult::Replied => return Ok(()),
                WaitResult::Cancelled => return Err(DeviceError::Unreachable),
                WaitResult::TimedOut => {
                    timeouts += 1;
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    let halted = match driver.fc_info() {
                        Ok(info) => info.status == MonitorStatus::Halted,
                        Err(e) => {
                            warn!(error = %e, "monitor status query failed");
                            false
                        },
                    };
                    if halted {
                        error!(timeouts, "secure monitor halted during MCP transaction");
                        self.fault();
                        return Err(DeviceError::Unreachable);
                    }
                    if timeouts >= self.config.max_timeouts {
                        error!(timeouts, "secure monitor stopped answering MCP commands");
                        self.fault();
                        return Err(DeviceError::Unreachable);
                    }
                    warn!(timeouts, "MCP reply timed out, monitor still running");
                },
            }
        }
    }
}
