//! In-process secure monitor.
//!
//! [`MonitorEmulator`] implements [`KernelDriver`] without hardware: the
//! "secure world" is a state machine that runs on the caller's thread
//! whenever the normal world raises the interrupt (`fc_nsiq`) or yields a
//! time slice (`fc_yield`). It drains the daemon-to-monitor ring, executes
//! MCP commands, assigns session ids, echoes trustlet notifications back and
//! raises the secure-side interrupt that [`KernelDriver::wait_ssiq`] waits
//! for.
//!
//! # Fault injection
//!
//! The emulator exposes knobs to reproduce the failure modes a real monitor
//! shows:
//!
//! - [`MonitorEmulator::set_paused`]: interrupts are counted but nothing is
//!   processed until [`MonitorEmulator::resume`]
//! - [`MonitorEmulator::set_unresponsive`]: MCP commands are consumed and
//!   never answered
//! - [`MonitorEmulator::halt_after_status_checks`]: the status call reports
//!   [`MonitorStatus::Halted`] from the n-th call on
//! - [`MonitorEmulator::set_early_notification`]: a new session is notified
//!   before its `OPEN_SESSION` reply is published
//! - [`MonitorEmulator::set_reply_delay`]: MCP replies are held back
//! - [`MonitorEmulator::inject_notification`]: a trustlet signals its client

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::driver::{
    DriverError, DriverResult, KernelDriver, MonitorInfo, MonitorStatus, WaitOutcome,
};
use crate::mailbox::{HeapWords, Mailbox, MailboxLayout, SharedWords, Side};
use crate::mcp::{McpCommand, McpPayload, McpResponse, McpResult, WsmRef};
use crate::types::{MonitorVersion, Notification, SID_MCP, SessionId, SharedBuffer, WsmHandle};

/// Sessions the emulated monitor holds at once.
pub const MAX_SESSIONS: usize = 32;

const PAGE_SIZE: u64 = 4096;
const PHYS_BASE: u64 = 0x8000_0000;
const SECURE_VA_BASE: u32 = 0x0010_0000;

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmulatorStats {
    /// `fc_nsiq` calls.
    pub nsiq_calls: u64,
    /// `fc_yield` calls.
    pub yield_calls: u64,
    /// `fc_info` calls.
    pub status_checks: u64,
    /// MCP commands taken from the buffer, answered or not.
    pub mcp_commands: u64,
    /// `clean_orphans` calls.
    pub orphan_cleanups: u64,
}

#[derive(Debug)]
enum WsmKind {
    Allocated { _backing: Box<[u8]> },
    Registered,
}

#[derive(Debug)]
struct WsmEntry {
    buffer: SharedBuffer,
    locks: u32,
    kind: WsmKind,
}

#[derive(Debug)]
struct EmulatedSession {
    uuid: Uuid,
    mappings: BTreeMap<u32, u32>,
}

#[derive(Debug)]
struct EmulatorState {
    mailbox: Option<Mailbox>,
    status: MonitorStatus,
    halt_at_check: Option<u64>,
    wsm: BTreeMap<WsmHandle, WsmEntry>,
    next_handle: u32,
    next_phys: u64,
    sessions: BTreeMap<SessionId, EmulatedSession>,
    next_session_id: u32,
    next_secure_va: u32,
    rejected_uuids: HashSet<Uuid>,
    donated_bytes: u64,
    ssiq_pending: bool,
    stats: EmulatorStats,
}

impl EmulatorState {
    fn new() -> Self {
        Self {
            mailbox: None,
            status: MonitorStatus::NotInitialized,
            halt_at_check: None,
            wsm: BTreeMap::new(),
            next_handle: 1,
            next_phys: PHYS_BASE,
            sessions: BTreeMap::new(),
            next_session_id: 1,
            next_secure_va: SECURE_VA_BASE,
            rejected_uuids: HashSet::new(),
            donated_bytes: 0,
            ssiq_pending: false,
            stats: EmulatorStats::default(),
        }
    }

    fn alloc_phys(&mut self, len: usize) -> u64 {
        let phys = self.next_phys;
        let pages = (len as u64).div_ceil(PAGE_SIZE).max(1);
        self.next_phys += pages * PAGE_SIZE;
        phys
    }

    fn insert_wsm(&mut self, virt_addr: usize, len: usize, kind: WsmKind) -> SharedBuffer {
        let handle = WsmHandle::new(self.next_handle);
        self.next_handle += 1;
        let buffer = SharedBuffer {
            handle,
            virt_addr,
            phys_addr: self.alloc_phys(len),
            len,
        };
        self.wsm.insert(
            handle,
            WsmEntry {
                buffer,
                locks: 0,
                kind,
            },
        );
        buffer
    }

    fn entry_mut(&mut self, handle: WsmHandle) -> DriverResult<&mut WsmEntry> {
        self.wsm.get_mut(&handle).ok_or(DriverError::NotFound(handle))
    }
}

/// An in-process secure monitor implementing [`KernelDriver`].
#[derive(Debug)]
pub struct MonitorEmulator {
    state: Mutex<EmulatorState>,
    ssiq: Condvar,
    paused: AtomicBool,
    unresponsive: AtomicBool,
    early_notification: AtomicBool,
    reply_delay_ms: AtomicU64,
}

impl Default for MonitorEmulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorEmulator {
    /// Creates an emulator in the `NotInitialized` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmulatorState::new()),
            ssiq: Condvar::new(),
            paused: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            early_notification: AtomicBool::new(false),
            reply_delay_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops processing interrupts until [`MonitorEmulator::resume`].
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Unpauses and processes everything queued meanwhile.
    pub fn resume(&self) {
        self.set_paused(false);
        let mut state = self.lock();
        if state.status == MonitorStatus::Initialized {
            self.process(&mut state);
        }
    }

    /// Consume MCP commands without answering them.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Notify every new session once, ahead of its `OPEN_SESSION` reply.
    pub fn set_early_notification(&self, enabled: bool) {
        self.early_notification.store(enabled, Ordering::SeqCst);
    }

    /// Delay every MCP reply by `delay`.
    pub fn set_reply_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.reply_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Report `Halted` from the `n`-th status call after this one on.
    pub fn halt_after_status_checks(&self, n: u64) {
        let mut state = self.lock();
        state.halt_at_check = Some(state.stats.status_checks + n);
    }

    /// Halt immediately.
    pub fn halt(&self) {
        self.lock().status = MonitorStatus::Halted;
    }

    /// Refuse to load the trustlet `uuid`.
    pub fn reject_uuid(&self, uuid: Uuid) {
        self.lock().rejected_uuids.insert(uuid);
    }

    /// Queues a notification towards the daemon and raises the interrupt.
    ///
    /// Returns `false` if the mailbox is not mapped or the ring is full.
    pub fn inject_notification(&self, notification: Notification) -> bool {
        let mut state = self.lock();
        let queued = state
            .mailbox
            .as_ref()
            .is_some_and(|mailbox| mailbox.outbound().put(notification));
        if queued {
            self.raise(&mut state);
        }
        queued
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> EmulatorStats {
        self.lock().stats
    }

    /// Current status, without counting as a status call.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        self.lock().status
    }

    /// Open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Whether `session_id` is open.
    #[must_use]
    pub fn has_session(&self, session_id: SessionId) -> bool {
        self.lock().sessions.contains_key(&session_id)
    }

    /// Mappings held by `session_id`.
    #[must_use]
    pub fn mapping_count(&self, session_id: SessionId) -> usize {
        self.lock()
            .sessions
            .get(&session_id)
            .map_or(0, |session| session.mappings.len())
    }

    /// Live world-shared memory registrations.
    #[must_use]
    pub fn wsm_count(&self) -> usize {
        self.lock().wsm.len()
    }

    /// Whether `handle` is locked at least once.
    #[must_use]
    pub fn is_locked(&self, handle: WsmHandle) -> bool {
        self.lock().wsm.get(&handle).is_some_and(|entry| entry.locks > 0)
    }

    /// Memory donated through `DONATE_RAM`.
    #[must_use]
    pub fn donated_bytes(&self) -> u64 {
        self.lock().donated_bytes
    }

    /// `(write_count, read_count)` of the daemon-to-monitor ring.
    #[must_use]
    pub fn inbound_counters(&self) -> Option<(u32, u32)> {
        self.lock().mailbox.as_ref().map(|mailbox| {
            (
                mailbox.inbound().write_count(),
                mailbox.inbound().read_count(),
            )
        })
    }

    fn raise(&self, state: &mut EmulatorState) {
        state.ssiq_pending = true;
        self.ssiq.notify_all();
    }

    fn process(&self, state: &mut EmulatorState) {
        let Some(mailbox) = state.mailbox.take() else {
            return;
        };
        let mut raised = false;
        while let Some(notification) = mailbox.inbound().get() {
            if notification.is_mcp() {
                raised |= self.handle_mcp(state, &mailbox);
            } else if state.sessions.contains_key(&notification.session_id) {
                trace!(session_id = %notification.session_id, "trustlet notified");
                raised |= mailbox
                    .outbound()
                    .put(Notification::new(notification.session_id, 0));
            } else {
                debug!(session_id = %notification.session_id, "notification for unknown session ignored");
            }
        }
        state.mailbox = Some(mailbox);
        if raised {
            self.raise(state);
        }
    }

    fn handle_mcp(&self, state: &mut EmulatorState, mailbox: &Mailbox) -> bool {
        state.stats.mcp_commands += 1;
        let command = match McpCommand::decode(&mailbox.mcp().read()) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "emulated monitor ignoring malformed MCP command");
                return false;
            },
        };
        if self.unresponsive.load(Ordering::SeqCst) {
            debug!(command = %command.id(), "emulated monitor swallowing MCP command");
            return false;
        }
        let delay = self.reply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let response = self.execute(state, mailbox, command);
        trace!(command = %response.id, result = %response.result, "emulated monitor replying");
        if let Err(e) = mailbox.mcp().write(&response.encode()) {
            warn!(error = %e, "emulated monitor cannot write MCP reply");
            return false;
        }
        mailbox.outbound().put(Notification::new(SID_MCP, 0))
    }

    fn execute(
        &self,
        state: &mut EmulatorState,
        mailbox: &Mailbox,
        command: McpCommand,
    ) -> McpResponse {
        let id = command.id();
        match command {
            McpCommand::OpenSession { uuid, tci, image } => {
                if tci.len == 0 || image.len == 0 || image.header_len > image.len {
                    return McpResponse::new(id, McpResult::InvalidParam);
                }
                if state.rejected_uuids.contains(&uuid) {
                    return McpResponse::new(id, McpResult::UnknownUuid);
                }
                if state.sessions.len() >= MAX_SESSIONS {
                    return McpResponse::new(id, McpResult::NoMoreSessions);
                }
                let session_id = SessionId::new(state.next_session_id);
                state.next_session_id += 1;
                state.sessions.insert(
                    session_id,
                    EmulatedSession {
                        uuid,
                        mappings: BTreeMap::new(),
                    },
                );
                if self.early_notification.load(Ordering::SeqCst) {
                    mailbox.outbound().put(Notification::new(session_id, 0));
                }
                debug!(%session_id, %uuid, "emulated trustlet loaded");
                McpResponse::ok(id, McpPayload::OpenSession { session_id })
            },
            McpCommand::CloseSession { session_id } => match state.sessions.remove(&session_id) {
                Some(session) => {
                    debug!(%session_id, uuid = %session.uuid, "emulated trustlet unloaded");
                    McpResponse::new(id, McpResult::Ok)
                },
                None => McpResponse::new(id, McpResult::InvalidSession),
            },
            McpCommand::Map { session_id, buffer } => {
                Self::map(state, session_id, buffer).map_or_else(
                    |result| McpResponse::new(id, result),
                    |secure_virtual_addr| {
                        McpResponse::ok(
                            id,
                            McpPayload::Map {
                                secure_virtual_addr,
                            },
                        )
                    },
                )
            },
            McpCommand::Unmap {
                session_id,
                secure_virtual_addr,
                ..
            } => match state.sessions.get_mut(&session_id) {
                None => McpResponse::new(id, McpResult::InvalidSession),
                Some(session) => {
                    if session.mappings.remove(&secure_virtual_addr).is_some() {
                        McpResponse::new(id, McpResult::Ok)
                    } else {
                        McpResponse::new(id, McpResult::InvalidParam)
                    }
                },
            },
            McpCommand::DonateRam { len, .. } => {
                state.donated_bytes += u64::from(len);
                McpResponse::new(id, McpResult::Ok)
            },
            McpCommand::Suspend | McpCommand::Resume => McpResponse::new(id, McpResult::Ok),
            McpCommand::GetMobicoreVersion => {
                McpResponse::ok(id, McpPayload::Version(emulated_version()))
            },
        }
    }

    fn map(
        state: &mut EmulatorState,
        session_id: SessionId,
        buffer: WsmRef,
    ) -> Result<u32, McpResult> {
        if !state.sessions.contains_key(&session_id) {
            return Err(McpResult::InvalidSession);
        }
        if buffer.len == 0 || u64::from(buffer.offset) >= PAGE_SIZE {
            return Err(McpResult::InvalidParam);
        }
        let span = u64::from(buffer.offset) + u64::from(buffer.len);
        let pages = u32::try_from(span.div_ceil(PAGE_SIZE) * PAGE_SIZE)
            .map_err(|_| McpResult::OutOfResources)?;
        let base = state.next_secure_va;
        state.next_secure_va = base
            .checked_add(pages)
            .ok_or(McpResult::OutOfResources)?;
        let secure_virtual_addr = base + buffer.offset;
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.mappings.insert(secure_virtual_addr, buffer.len);
        }
        Ok(secure_virtual_addr)
    }
}

fn emulated_version() -> MonitorVersion {
    MonitorVersion {
        product_id: "tzd-emulator".to_string(),
        mci: 0x0001_0000,
        so: 0x0002_0000,
        mclf: 0x0002_0002,
        container: 0x0002_0000,
        mc_config: 0x0000_0002,
        tl_api: 0x0001_0004,
        dr_api: 0x0001_0002,
        cmp: 0x0001_0000,
    }
}

impl KernelDriver for MonitorEmulator {
    fn map_mailbox(&self, words: usize) -> DriverResult<Arc<dyn SharedWords>> {
        let mut state = self.lock();
        let phys = state.alloc_phys(words * 4);
        let region: Arc<dyn SharedWords> = Arc::new(HeapWords::new(words, phys));
        let mailbox =
            Mailbox::attach(Arc::clone(&region), Side::Secure).map_err(|e| DriverError::Rejected {
                call: "map_mailbox",
                reason: e.to_string(),
            })?;
        state.mailbox = Some(mailbox);
        Ok(region)
    }

    fn alloc_wsm(&self, len: usize) -> DriverResult<SharedBuffer> {
        if len == 0 {
            return Err(DriverError::OutOfMemory { len });
        }
        let backing = vec![0u8; len].into_boxed_slice();
        let virt_addr = backing.as_ptr() as usize;
        Ok(self.lock().insert_wsm(
            virt_addr,
            len,
            WsmKind::Allocated { _backing: backing },
        ))
    }

    fn free_wsm(&self, handle: WsmHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let entry = state.entry_mut(handle)?;
        if !matches!(entry.kind, WsmKind::Allocated { .. }) {
            return Err(DriverError::Rejected {
                call: "free_wsm",
                reason: format!("{handle} is a registration, not an allocation"),
            });
        }
        if entry.locks > 0 {
            return Err(DriverError::Rejected {
                call: "free_wsm",
                reason: format!("{handle} is locked"),
            });
        }
        state.wsm.remove(&handle);
        Ok(())
    }

    fn register_wsm(&self, virt_addr: usize, len: usize) -> DriverResult<SharedBuffer> {
        if len == 0 {
            return Err(DriverError::Rejected {
                call: "register_wsm",
                reason: "empty buffer".to_string(),
            });
        }
        Ok(self.lock().insert_wsm(virt_addr, len, WsmKind::Registered))
    }

    fn unregister_wsm(&self, handle: WsmHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let entry = state.entry_mut(handle)?;
        if !matches!(entry.kind, WsmKind::Registered) {
            return Err(DriverError::Rejected {
                call: "unregister_wsm",
                reason: format!("{handle} is an allocation, not a registration"),
            });
        }
        if entry.locks > 0 {
            return Err(DriverError::Rejected {
                call: "unregister_wsm",
                reason: format!("{handle} is locked"),
            });
        }
        state.wsm.remove(&handle);
        Ok(())
    }

    fn lock_wsm(&self, handle: WsmHandle) -> DriverResult<()> {
        self.lock().entry_mut(handle)?.locks += 1;
        Ok(())
    }

    fn unlock_wsm(&self, handle: WsmHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let entry = state.entry_mut(handle)?;
        if entry.locks == 0 {
            return Err(DriverError::Rejected {
                call: "unlock_wsm",
                reason: format!("{handle} is not locked"),
            });
        }
        entry.locks -= 1;
        Ok(())
    }

    fn find_wsm(&self, handle: WsmHandle) -> DriverResult<SharedBuffer> {
        self.lock()
            .wsm
            .get(&handle)
            .map(|entry| entry.buffer)
            .ok_or(DriverError::NotFound(handle))
    }

    fn clean_orphans(&self) -> DriverResult<()> {
        // Registrations here are owned by the process itself and never
        // outlive it, so there is nothing to reclaim.
        self.lock().stats.orphan_cleanups += 1;
        Ok(())
    }

    fn fc_init(&self, layout: &MailboxLayout) -> DriverResult<()> {
        let mut state = self.lock();
        let Some(mailbox) = state.mailbox.as_ref() else {
            return Err(DriverError::Rejected {
                call: "fc_init",
                reason: "mailbox not mapped".to_string(),
            });
        };
        if mailbox.layout() != *layout {
            return Err(DriverError::Rejected {
                call: "fc_init",
                reason: "layout does not match the mapped mailbox".to_string(),
            });
        }
        if state.status == MonitorStatus::NotInitialized {
            state.status = MonitorStatus::Initialized;
            debug!(phys_addr = layout.phys_addr, "emulated monitor initialised");
        }
        Ok(())
    }

    fn fc_yield(&self) -> DriverResult<()> {
        let mut state = self.lock();
        state.stats.yield_calls += 1;
        if state.status == MonitorStatus::Initialized && !self.paused.load(Ordering::SeqCst) {
            self.process(&mut state);
        }
        Ok(())
    }

    fn fc_nsiq(&self) -> DriverResult<()> {
        let mut state = self.lock();
        state.stats.nsiq_calls += 1;
        if state.status == MonitorStatus::Initialized && !self.paused.load(Ordering::SeqCst) {
            self.process(&mut state);
        }
        Ok(())
    }

    fn fc_info(&self) -> DriverResult<MonitorInfo> {
        let mut state = self.lock();
        state.stats.status_checks += 1;
        if state
            .halt_at_check
            .is_some_and(|at| state.stats.status_checks >= at)
        {
            state.status = MonitorStatus::Halted;
        }
        Ok(MonitorInfo {
            status: state.status,
            ext_info: 0,
        })
    }

    fn wait_ssiq(&self, timeout: Duration) -> DriverResult<WaitOutcome> {
        let state = self.lock();
        let (mut state, _) = self
            .ssiq
            .wait_timeout_while(state, timeout, |state| !state.ssiq_pending)
            .unwrap_or_else(PoisonError::into_inner);
        if state.ssiq_pending {
            state.ssiq_pending = false;
            Ok(WaitOutcome::Signaled)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MAILBOX_WORDS;
    use crate::mcp::{LoadImage, McpCommandId};

    struct Harness {
        emulator: MonitorEmulator,
        mailbox: Mailbox,
    }

    fn harness() -> Harness {
        let emulator = MonitorEmulator::new();
        let region = emulator.map_mailbox(MAILBOX_WORDS).unwrap();
        let mailbox = Mailbox::attach(region, Side::Normal).unwrap();
        mailbox.format();
        emulator.fc_init(&mailbox.layout()).unwrap();
        Harness { emulator, mailbox }
    }

    impl Harness {
        fn call(&self, command: &McpCommand) -> Option<McpResponse> {
            self.mailbox.mcp().write(&command.encode()).unwrap();
            assert!(self.mailbox.outbound().put(Notification::new(SID_MCP, 0)));
            self.emulator.fc_nsiq().unwrap();
            let reply = self.mailbox.inbound().get()?;
            assert!(reply.is_mcp());
            Some(McpResponse::decode(&self.mailbox.mcp().read()).unwrap())
        }

        fn open(&self) -> SessionId {
            let command = McpCommand::OpenSession {
                uuid: Uuid::from_bytes([9; 16]),
                tci: WsmRef {
                    phys_addr: 0x1000,
                    offset: 0,
                    len: 64,
                },
                image: LoadImage {
                    phys_addr: 0x2000,
                    len: 256,
                    header_len: 128,
                },
            };
            match self.call(&command).unwrap().payload {
                McpPayload::OpenSession { session_id } => session_id,
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn fc_init_requires_mapping() {
        let emulator = MonitorEmulator::new();
        let layout = MailboxLayout {
            phys_addr: 0,
            nq_offset: 0,
            nq_len: 0,
            mcp_offset: 0,
            mcp_len: 0,
        };
        assert!(emulator.fc_init(&layout).is_err());
        assert_eq!(emulator.status(), MonitorStatus::NotInitialized);
    }

    #[test]
    fn open_session_assigns_increasing_ids() {
        let h = harness();
        let first = h.open();
        let second = h.open();
        assert_eq!(first, SessionId::new(1));
        assert_eq!(second, SessionId::new(2));
        assert_eq!(h.emulator.session_count(), 2);
        assert_eq!(h.emulator.stats().mcp_commands, 2);
    }

    #[test]
    fn map_and_unmap() {
        let h = harness();
        let sid = h.open();
        let reply = h
            .call(&McpCommand::Map {
                session_id: sid,
                buffer: WsmRef {
                    phys_addr: 0x3000,
                    offset: 16,
                    len: 100,
                },
            })
            .unwrap();
        let McpPayload::Map {
            secure_virtual_addr,
        } = reply.payload
        else {
            panic!("no address in {reply:?}");
        };
        assert_eq!(secure_virtual_addr, SECURE_VA_BASE + 16);
        assert_eq!(h.emulator.mapping_count(sid), 1);

        let unmap = McpCommand::Unmap {
            session_id: sid,
            secure_virtual_addr,
            len: 100,
        };
        assert_eq!(h.call(&unmap).unwrap().result, McpResult::Ok);
        assert_eq!(h.call(&unmap).unwrap().result, McpResult::InvalidParam);
    }

    #[test]
    fn close_unknown_session() {
        let h = harness();
        let reply = h
            .call(&McpCommand::CloseSession {
                session_id: SessionId::new(42),
            })
            .unwrap();
        assert_eq!(reply.id, McpCommandId::CloseSession);
        assert_eq!(reply.result, McpResult::InvalidSession);
    }

    #[test]
    fn unresponsive_monitor_consumes_without_reply() {
        let h = harness();
        h.emulator.set_unresponsive(true);
        assert!(h.call(&McpCommand::GetMobicoreVersion).is_none());
        assert_eq!(h.emulator.stats().mcp_commands, 1);
        assert!(h.mailbox.outbound().is_empty());
    }

    #[test]
    fn halt_after_status_checks() {
        let h = harness();
        h.emulator.halt_after_status_checks(2);
        assert_eq!(h.emulator.fc_info().unwrap().status, MonitorStatus::Initialized);
        assert_eq!(h.emulator.fc_info().unwrap().status, MonitorStatus::Halted);
    }

    #[test]
    fn trustlet_notifications_are_echoed() {
        let h = harness();
        let sid = h.open();
        assert!(h.mailbox.outbound().put(Notification::new(sid, 0)));
        assert!(
            h.mailbox
                .outbound()
                .put(Notification::new(SessionId::new(77), 0))
        );
        h.emulator.fc_nsiq().unwrap();
        assert_eq!(h.mailbox.inbound().get(), Some(Notification::new(sid, 0)));
        assert_eq!(h.mailbox.inbound().get(), None);
        assert_eq!(
            h.emulator.wait_ssiq(Duration::from_millis(1)).unwrap(),
            WaitOutcome::Signaled
        );
        assert_eq!(
            h.emulator.wait_ssiq(Duration::from_millis(1)).unwrap(),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn paused_monitor_processes_on_resume() {
        let h = harness();
        h.emulator.set_paused(true);
        h.mailbox.mcp().write(&McpCommand::Suspend.encode()).unwrap();
        assert!(h.mailbox.outbound().put(Notification::new(SID_MCP, 0)));
        h.emulator.fc_nsiq().unwrap();
        assert!(h.mailbox.inbound().is_empty());

        h.emulator.resume();
        assert_eq!(h.mailbox.inbound().get(), Some(Notification::new(SID_MCP, 0)));
    }

    #[test]
    fn wsm_lifecycle() {
        let emulator = MonitorEmulator::new();
        let tci = emulator.alloc_wsm(4096).unwrap();
        assert_eq!(emulator.find_wsm(tci.handle).unwrap(), tci);
        emulator.lock_wsm(tci.handle).unwrap();
        assert!(emulator.is_locked(tci.handle));
        assert!(emulator.free_wsm(tci.handle).is_err());
        emulator.unlock_wsm(tci.handle).unwrap();
        assert!(emulator.unlock_wsm(tci.handle).is_err());
        emulator.free_wsm(tci.handle).unwrap();
        assert!(matches!(
            emulator.find_wsm(tci.handle),
            Err(DriverError::NotFound(_))
        ));

        let reg = emulator.register_wsm(0x7000_0000, 100).unwrap();
        assert!(emulator.free_wsm(reg.handle).is_err());
        emulator.unregister_wsm(reg.handle).unwrap();
        assert_eq!(emulator.wsm_count(), 0);
    }
}
