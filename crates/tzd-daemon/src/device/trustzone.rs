//! TrustZone device: sessions, notifications and MCP over one mailbox.
//!
//! # Architecture
//!
//! ```text
//!  client threads                 interrupt thread          scheduler thread
//!  (listeners)                    (wait_ssiq loop)          (optional)
//!      |                                |                        |
//!      | open/close/map/unmap           | drain inbound ring     | fc_yield
//!      v                                v                        v
//!  McpChannel --- MCP buffer ---> monitor ---> inbound ring ----+
//!      ^                                |
//!      +------- signal_reply (SID 0) ---+
//!                                       +--> TrustletSession::deliver
//!                                       +--> unresolved list (unknown sid)
//! ```
//!
//! The session table and the unresolved-notification list share one lock.
//! Registering a new session and draining the unresolved entries for its
//! id happen under that lock, and the interrupt thread decides "known or
//! unresolved" under it too, so a notification racing `OPEN_SESSION` is
//! delivered exactly once and in order.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};
use tzd_core::config::DeviceConfig;
use tzd_core::driver::{KernelDriver, MonitorStatus, WaitOutcome};
use tzd_core::mailbox::{MAILBOX_WORDS, Mailbox, Side};
use tzd_core::mcp::{LoadImage, McpCommand, McpPayload, WsmRef};
use tzd_core::registry::Registry;
use tzd_core::types::MonitorVersion;
use tzd_core::wire::{
    MapBulkRequest, NqConnectRequest, OpenSessionRequest, OpenSessionResponse, UnmapBulkRequest,
};
use tzd_core::{DeviceId, Notification, SessionId, SharedBuffer};

use super::mcp_channel::{McpChannel, McpChannelConfig, ProtocolStats};
use super::{Device, DeviceError, DeviceResult};
use crate::connection::{ConnectionId, SharedConnection};
use crate::session::{BulkBuffer, TrustletSession, TrustletSessionParams};

const INIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SHUTDOWN_SLICE: Duration = Duration::from_millis(50);

/// Settings of a [`TrustZoneDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustZoneDeviceConfig {
    /// Device identifier.
    pub device_id: DeviceId,
    /// MCP timeout policy.
    pub mcp: McpChannelConfig,
    /// Bound on a single interrupt wait.
    pub irq_poll: Duration,
    /// Yield interval of the scheduler thread; `None` disables it.
    pub scheduler_interval: Option<Duration>,
    /// Memory donated at start-up; 0 disables donation.
    pub donate_ram_bytes: u32,
    /// Status checks after `fc_init` before start-up fails.
    pub init_poll_attempts: u32,
    /// Per-session notification queue bound.
    pub max_queued_notifications: usize,
    /// Bound of the unresolved-notification list.
    pub max_unresolved_notifications: usize,
    /// Bound on one write to a notification connection.
    pub notification_write_timeout: Duration,
}

impl Default for TrustZoneDeviceConfig {
    fn default() -> Self {
        Self::from(&DeviceConfig::default())
    }
}

impl From<&DeviceConfig> for TrustZoneDeviceConfig {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            device_id: config.device_id,
            mcp: McpChannelConfig {
                timeout: config.mcp_timeout(),
                max_timeouts: config.mcp_max_timeouts,
            },
            irq_poll: config.irq_poll(),
            scheduler_interval: config.scheduler_interval(),
            donate_ram_bytes: config.donate_ram_bytes,
            init_poll_attempts: config.init_poll_attempts,
            max_queued_notifications: config.max_queued_notifications,
            max_unresolved_notifications: config.max_unresolved_notifications,
            notification_write_timeout: config.notification_write_timeout(),
        }
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: Vec<Arc<TrustletSession>>,
    unresolved: VecDeque<Notification>,
}

impl SessionTable {
    fn find(&self, session_id: SessionId) -> Option<&Arc<TrustletSession>> {
        self.sessions.iter().find(|session| session.id() == session_id)
    }

    fn remove(&mut self, session_id: SessionId) -> Option<Arc<TrustletSession>> {
        let index = self
            .sessions
            .iter()
            .position(|session| session.id() == session_id)?;
        Some(self.sessions.remove(index))
    }

    fn take_unresolved(&mut self, session_id: SessionId) -> Vec<Notification> {
        let mut matched = Vec::new();
        self.unresolved.retain(|notification| {
            if notification.session_id == session_id {
                matched.push(*notification);
                false
            } else {
                true
            }
        });
        matched
    }
}

struct DeviceInner {
    config: TrustZoneDeviceConfig,
    driver: Arc<dyn KernelDriver>,
    registry: Arc<dyn Registry>,
    mailbox: Mailbox,
    mcp: McpChannel,
    table: Mutex<SessionTable>,
    connections: Mutex<HashSet<ConnectionId>>,
    next_device_session_id: AtomicU32,
    version: OnceLock<MonitorVersion>,
    donated: Mutex<Vec<SharedBuffer>>,
    shutdown: AtomicBool,
}

/// A secure-world device driven through a [`KernelDriver`].
pub struct TrustZoneDevice {
    inner: Arc<DeviceInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TrustZoneDevice {
    /// Brings the device up.
    ///
    /// Maps and formats the mailbox, initialises the monitor and waits for
    /// it to report itself running, starts the interrupt thread (and the
    /// scheduler thread when configured), then donates RAM if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if any step before the worker threads run fails.
    /// A failed RAM donation is logged and does not fail start-up.
    pub fn start(
        config: TrustZoneDeviceConfig,
        driver: Arc<dyn KernelDriver>,
        registry: Arc<dyn Registry>,
    ) -> DeviceResult<Self> {
        let region = driver.map_mailbox(MAILBOX_WORDS)?;
        let mailbox = Mailbox::attach(region, Side::Normal)?;
        mailbox.format();
        driver.fc_init(&mailbox.layout())?;
        wait_until_initialized(driver.as_ref(), config.init_poll_attempts)?;

        let inner = Arc::new(DeviceInner {
            mcp: McpChannel::new(config.mcp),
            config,
            driver,
            registry,
            mailbox,
            table: Mutex::new(SessionTable::default()),
            connections: Mutex::new(HashSet::new()),
            next_device_session_id: AtomicU32::new(1),
            version: OnceLock::new(),
            donated: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let device_id = inner.config.device_id;
        let mut workers = Vec::new();
        let irq = Arc::clone(&inner);
        workers.push(spawn_worker(format!("tzd-irq-{}", device_id.as_u32()), move || {
            irq.run_interrupt_loop();
        })?);
        if let Some(interval) = inner.config.scheduler_interval {
            let scheduler = Arc::clone(&inner);
            let handle = spawn_worker(format!("tzd-sched-{}", device_id.as_u32()), move || {
                scheduler.run_scheduler_loop(interval);
            });
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    inner.shutdown.store(true, Ordering::SeqCst);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e);
                },
            }
        }

        let device = Self {
            inner,
            workers: Mutex::new(workers),
        };
        info!(%device_id, "device started");

        let donate = device.inner.config.donate_ram_bytes;
        if donate > 0 {
            if let Err(e) = device.donate_ram(donate) {
                warn!(%device_id, bytes = donate, error = %e, "RAM donation failed");
            }
        }
        Ok(device)
    }

    /// MCP channel counters.
    #[must_use]
    pub fn protocol_stats(&self) -> ProtocolStats {
        self.inner.mcp.stats()
    }

    /// Open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.table().sessions.len()
    }

    /// Looks up an open session.
    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<Arc<TrustletSession>> {
        self.inner.table().find(session_id).cloned()
    }

    /// Notifications held for unknown session ids.
    #[must_use]
    pub fn unresolved_notifications(&self) -> usize {
        self.inner.table().unresolved.len()
    }

    /// `(write_count, read_count)` of the ring towards the monitor.
    #[must_use]
    pub fn outbound_counters(&self) -> (u32, u32) {
        let ring = self.inner.mailbox.outbound();
        (ring.write_count(), ring.read_count())
    }
}

fn wait_until_initialized(driver: &dyn KernelDriver, attempts: u32) -> DeviceResult<()> {
    for attempt in 1..=attempts {
        match driver.fc_info()?.status {
            MonitorStatus::Initialized => {
                debug!(attempt, "secure monitor initialised");
                return Ok(());
            },
            MonitorStatus::Halted => {
                error!("secure monitor halted during initialisation");
                return Err(DeviceError::Unreachable);
            },
            MonitorStatus::NotInitialized => {
                driver.fc_yield()?;
                thread::sleep(INIT_POLL_INTERVAL);
            },
        }
    }
    Err(DeviceError::NotInitialized { attempts })
}

fn spawn_worker(
    name: String,
    body: impl FnOnce() + Send + 'static,
) -> DeviceResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|e| DeviceError::OutOfResources(format!("cannot spawn {name}: {e}")))
}

fn sleep_unless(flag: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !flag.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(SHUTDOWN_SLICE));
    }
}

impl DeviceInner {
    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_usable(&self) -> DeviceResult<()> {
        if self.mcp.is_faulted() || self.shutdown.load(Ordering::SeqCst) {
            return Err(DeviceError::Unreachable);
        }
        Ok(())
    }

    fn transact(&self, command: &McpCommand) -> DeviceResult<McpPayload> {
        self.mcp
            .transact(&self.mailbox, self.driver.as_ref(), command)
            .map(|response| response.payload)
    }

    fn owned_session(
        &self,
        owner: &SharedConnection,
        session_id: SessionId,
    ) -> DeviceResult<Arc<TrustletSession>> {
        self.table()
            .find(session_id)
            .filter(|session| session.owner() == owner.id())
            .cloned()
            .ok_or(DeviceError::UnknownSession(session_id))
    }

    fn run_interrupt_loop(&self) {
        debug!(device_id = %self.config.device_id, "interrupt thread started");
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.driver.wait_ssiq(self.config.irq_poll) {
                Ok(WaitOutcome::Signaled | WaitOutcome::TimedOut) => self.drain_notifications(),
                Err(e) => {
                    warn!(error = %e, "waiting for the secure interrupt failed");
                    sleep_unless(&self.shutdown, self.config.irq_poll);
                },
            }
        }
        debug!(device_id = %self.config.device_id, "interrupt thread stopped");
    }

    fn drain_notifications(&self) {
        while let Some(notification) = self.mailbox.inbound().get() {
            if notification.is_mcp() {
                self.mcp.signal_reply();
            } else {
                self.dispatch_notification(notification);
            }
        }
    }

    fn dispatch_notification(&self, notification: Notification) {
        let session = {
            let mut table = self.table();
            if let Some(session) = table.find(notification.session_id) {
                Arc::clone(session)
            } else {
                if table.unresolved.len() >= self.config.max_unresolved_notifications {
                    if let Some(dropped) = table.unresolved.pop_front() {
                        warn!(session_id = %dropped.session_id, "unresolved notification list full, dropping oldest");
                    }
                }
                trace!(session_id = %notification.session_id, "holding notification for unknown session");
                table.unresolved.push_back(notification);
                return;
            }
        };
        trace!(session_id = %notification.session_id, payload = notification.payload, "notification");
        session.deliver(notification);
    }

    fn run_scheduler_loop(&self, interval: Duration) {
        debug!(device_id = %self.config.device_id, ?interval, "scheduler thread started");
        while !self.shutdown.load(Ordering::SeqCst) {
            sleep_unless(&self.shutdown, interval);
            if self.shutdown.load(Ordering::SeqCst) || self.mcp.is_faulted() {
                continue;
            }
            if let Err(e) = self.driver.fc_yield() {
                warn!(error = %e, "yield to secure world failed");
            }
        }
        debug!(device_id = %self.config.device_id, "scheduler thread stopped");
    }

    fn open_session(
        &self,
        owner: &SharedConnection,
        request: &OpenSessionRequest,
    ) -> DeviceResult<OpenSessionResponse> {
        self.ensure_usable()?;
        let tci = self
            .driver
            .find_wsm(request.tci_handle)
            .map_err(|_| DeviceError::WsmNotFound(request.tci_handle))?;
        if request.tci_len == 0 || request.tci_len as usize > tci.len {
            return Err(DeviceError::InvalidParameter(format!(
                "TCI length {} outside buffer of {} bytes",
                request.tci_len, tci.len
            )));
        }
        let blob = self.registry.load_trustlet(&request.uuid)?;
        let image_len = u32::try_from(blob.len()).map_err(|_| {
            DeviceError::InvalidParameter(format!("trustlet image of {} bytes", blob.len()))
        })?;

        self.driver.lock_wsm(tci.handle)?;
        let image = match self
            .driver
            .register_wsm(blob.image().as_ptr() as usize, blob.len())
        {
            Ok(image) => image,
            Err(e) => {
                self.unlock_quietly(&tci);
                return Err(e.into());
            },
        };

        let command = McpCommand::OpenSession {
            uuid: request.uuid,
            tci: WsmRef {
                phys_addr: tci.phys_addr,
                offset: 0,
                len: request.tci_len,
            },
            image: LoadImage {
                phys_addr: image.phys_addr,
                len: image_len,
                header_len: u32::try_from(blob.header_len()).unwrap_or(image_len),
            },
        };
        let session_id = match self.transact(&command) {
            Ok(McpPayload::OpenSession { session_id }) => session_id,
            Ok(other) => {
                error!(?other, "OPEN_SESSION reply without session id");
                self.mcp.fault();
                self.release_open_failure(&tci, &image);
                return Err(DeviceError::Unreachable);
            },
            Err(e) => {
                self.release_open_failure(&tci, &image);
                return Err(e);
            },
        };

        let session = Arc::new(TrustletSession::new(TrustletSessionParams {
            session_id,
            device_id: self.config.device_id,
            device_session_id: self.next_device_session_id.fetch_add(1, Ordering::SeqCst),
            magic: rand::random(),
            owner: owner.id(),
            tci_handle: tci.handle,
            max_queued_notifications: self.config.max_queued_notifications,
            notification_write_timeout: self.config.notification_write_timeout,
        }));
        if let Err(e) = session
            .session()
            .add_bulk_buffer(BulkBuffer::new(image, 0, image_len).with_backing(Arc::clone(blob.image())))
        {
            warn!(%session_id, error = %e, "cannot track trustlet image registration");
        }

        {
            let mut table = self.table();
            if table.find(session_id).is_some() {
                drop(table);
                error!(%session_id, "monitor reused a live session id");
                self.mcp.fault();
                session.teardown(self.driver.as_ref());
                return Err(DeviceError::Unreachable);
            }
            table.sessions.push(Arc::clone(&session));
            for early in table.take_unresolved(session_id) {
                session.queue_notification(early);
            }
        }

        info!(
            %session_id,
            device_session_id = session.device_session_id(),
            uuid = %request.uuid,
            owner = %owner.id(),
            "session opened"
        );
        Ok(OpenSessionResponse {
            session_id,
            device_session_id: session.device_session_id(),
            session_magic: session.magic(),
        })
    }

    fn unlock_quietly(&self, buffer: &SharedBuffer) {
        if let Err(e) = self.driver.unlock_wsm(buffer.handle) {
            warn!(handle = %buffer.handle, error = %e, "failed to unlock world-shared memory");
        }
    }

    fn release_open_failure(&self, tci: &SharedBuffer, image: &SharedBuffer) {
        if let Err(e) = self.driver.unregister_wsm(image.handle) {
            warn!(handle = %image.handle, error = %e, "failed to unregister trustlet image");
        }
        self.unlock_quietly(tci);
    }

    fn close_session(&self, session_id: SessionId) -> DeviceResult<()> {
        self.ensure_usable()?;
        self.transact(&McpCommand::CloseSession { session_id })
            .map(|_| ())
    }

    fn remove_session(&self, session_id: SessionId) {
        let removed = {
            let mut table = self.table();
            let stale = table.take_unresolved(session_id);
            if !stale.is_empty() {
                debug!(%session_id, dropped = stale.len(), "discarding notifications for a closed session");
            }
            table.remove(session_id)
        };
        if let Some(session) = removed {
            session.teardown(self.driver.as_ref());
            info!(%session_id, "session closed");
        }
    }

    fn close_owned_sessions(&self, owner: ConnectionId) {
        let owned: Vec<Arc<TrustletSession>> = self
            .table()
            .sessions
            .iter()
            .filter(|session| session.owner() == owner)
            .cloned()
            .collect();
        for session in owned.iter().rev() {
            if !self.mcp.is_faulted() {
                if let Err(e) = self.close_session(session.id()) {
                    warn!(session_id = %session.id(), error = %e, "monitor did not close session");
                }
            }
            self.remove_session(session.id());
        }
    }

    fn map_bulk(&self, owner: &SharedConnection, request: &MapBulkRequest) -> DeviceResult<u32> {
        self.ensure_usable()?;
        let session = self.owned_session(owner, request.session_id)?;
        let buffer = self
            .driver
            .find_wsm(request.handle)
            .map_err(|_| DeviceError::WsmNotFound(request.handle))?;
        if request.len == 0 {
            return Err(DeviceError::InvalidParameter("empty bulk buffer".to_string()));
        }
        if request.l2_phys_addr != buffer.phys_addr {
            return Err(DeviceError::InvalidParameter(format!(
                "page table {:#x} does not belong to {}",
                request.l2_phys_addr, request.handle
            )));
        }
        self.driver.lock_wsm(buffer.handle)?;
        if let Err(e) = session
            .session()
            .add_bulk_buffer(BulkBuffer::new(buffer, request.offset, request.len).locked())
        {
            self.unlock_quietly(&buffer);
            return Err(e.into());
        }

        let command = McpCommand::Map {
            session_id: request.session_id,
            buffer: WsmRef {
                phys_addr: buffer.phys_addr,
                offset: request.offset,
                len: request.len,
            },
        };
        match self.transact(&command) {
            Ok(McpPayload::Map {
                secure_virtual_addr,
            }) => {
                session
                    .session()
                    .set_secure_address(request.handle, secure_virtual_addr)?;
                debug!(
                    session_id = %request.session_id,
                    handle = %request.handle,
                    secure_virtual_addr,
                    "bulk buffer mapped"
                );
                Ok(secure_virtual_addr)
            },
            Ok(other) => {
                error!(?other, "MAP reply without address");
                self.mcp.fault();
                Err(DeviceError::Unreachable)
            },
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                match session.session().remove_bulk_buffer(request.handle) {
                    Ok(_) => self.unlock_quietly(&buffer),
                    Err(rollback) => {
                        warn!(handle = %request.handle, error = %rollback, "failed to roll back bulk buffer");
                    },
                }
                Err(e)
            },
        }
    }

    fn unmap_bulk(
        &self,
        owner: &SharedConnection,
        request: &UnmapBulkRequest,
    ) -> DeviceResult<()> {
        self.ensure_usable()?;
        let session = self.owned_session(owner, request.session_id)?;
        session
            .session()
            .check_mapping(request.handle, request.secure_virtual_addr, request.len)?;
        self.transact(&McpCommand::Unmap {
            session_id: request.session_id,
            secure_virtual_addr: request.secure_virtual_addr,
            len: request.len,
        })?;
        let buffer = session.session().remove_bulk_buffer(request.handle)?;
        if buffer.is_locked() {
            self.unlock_quietly(&buffer.buffer);
        }
        if let Err(e) = self.driver.unregister_wsm(buffer.handle()) {
            warn!(handle = %buffer.handle(), error = %e, "failed to unregister bulk buffer");
        }
        debug!(session_id = %request.session_id, handle = %request.handle, "bulk buffer unmapped");
        Ok(())
    }

    fn notify(&self, owner: &SharedConnection, session_id: SessionId) {
        if self.ensure_usable().is_err() {
            debug!(%session_id, "device unusable, dropping notify");
            return;
        }
        if self.owned_session(owner, session_id).is_err() {
            debug!(%session_id, owner = %owner.id(), "notify for unknown session dropped");
            return;
        }
        if !self.mailbox.outbound().put(Notification::new(session_id, 0)) {
            warn!(%session_id, "notification queue full, notify dropped");
            return;
        }
        if let Err(e) = self.driver.fc_nsiq() {
            warn!(%session_id, error = %e, "failed to signal secure world");
        }
    }

    fn donate_ram(&self, len: u32) -> DeviceResult<()> {
        self.ensure_usable()?;
        let buffer = self.driver.alloc_wsm(len as usize)?;
        let command = McpCommand::DonateRam {
            phys_addr: buffer.phys_addr,
            len,
        };
        match self.transact(&command) {
            Ok(_) => {
                info!(bytes = len, "RAM donated to secure world");
                self.donated
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(buffer);
                Ok(())
            },
            Err(e) => {
                if let Err(free) = self.driver.free_wsm(buffer.handle) {
                    warn!(handle = %buffer.handle, error = %free, "failed to free donation buffer");
                }
                Err(e)
            },
        }
    }

    fn mobicore_version(&self) -> DeviceResult<MonitorVersion> {
        if let Some(version) = self.version.get() {
            return Ok(version.clone());
        }
        self.ensure_usable()?;
        match self.transact(&McpCommand::GetMobicoreVersion)? {
            McpPayload::Version(version) => Ok(self.version.get_or_init(|| version).clone()),
            other => {
                error!(?other, "version reply without version block");
                self.mcp.fault();
                Err(DeviceError::Unreachable)
            },
        }
    }
}

impl Device for TrustZoneDevice {
    fn id(&self) -> DeviceId {
        self.inner.config.device_id
    }

    fn open(&self, owner: &SharedConnection) -> DeviceResult<()> {
        self.inner.ensure_usable()?;
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner.id());
        debug!(device_id = %self.id(), connection = %owner.id(), "device opened");
        Ok(())
    }

    fn close(&self, owner: &SharedConnection) {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&owner.id());
        self.inner.close_owned_sessions(owner.id());
        if let Err(e) = self.inner.driver.clean_orphans() {
            warn!(error = %e, "failed to clean orphaned registrations");
        }
        debug!(device_id = %self.id(), connection = %owner.id(), "device closed");
    }

    fn open_session(
        &self,
        owner: &SharedConnection,
        request: &OpenSessionRequest,
    ) -> DeviceResult<OpenSessionResponse> {
        self.inner.open_session(owner, request)
    }

    fn register_trustlet_connection(
        &self,
        connection: &SharedConnection,
        request: &NqConnectRequest,
        ack: &[u8],
    ) -> Option<Arc<TrustletSession>> {
        let session = self
            .inner
            .table()
            .sessions
            .iter()
            .find(|session| {
                session.matches(
                    request.device_session_id,
                    request.session_id,
                    request.session_magic,
                )
            })
            .cloned()?;
        if !session.attach_notification_connection(Arc::clone(connection), ack) {
            return None;
        }
        info!(session_id = %session.id(), connection = %connection.id(), "notification connection attached");
        Some(session)
    }

    fn close_session(&self, session_id: SessionId) -> DeviceResult<()> {
        self.inner.close_session(session_id)
    }

    fn close_trustlet_session(
        &self,
        owner: &SharedConnection,
        session_id: SessionId,
    ) -> DeviceResult<()> {
        let session = self.inner.owned_session(owner, session_id)?;
        self.inner.close_session(session.id())?;
        self.inner.remove_session(session.id());
        Ok(())
    }

    fn map_bulk(&self, owner: &SharedConnection, request: &MapBulkRequest) -> DeviceResult<u32> {
        self.inner.map_bulk(owner, request)
    }

    fn unmap_bulk(
        &self,
        owner: &SharedConnection,
        request: &UnmapBulkRequest,
    ) -> DeviceResult<()> {
        self.inner.unmap_bulk(owner, request)
    }

    fn notify(&self, owner: &SharedConnection, session_id: SessionId) {
        self.inner.notify(owner, session_id);
    }

    fn donate_ram(&self, len: u32) -> DeviceResult<()> {
        self.inner.donate_ram(len)
    }

    fn mobicore_version(&self) -> DeviceResult<MonitorVersion> {
        self.inner.mobicore_version()
    }

    fn is_faulted(&self) -> bool {
        self.inner.mcp.is_faulted()
    }

    fn shutdown(&self) {
        let device_id = self.id();
        let sessions: Vec<Arc<TrustletSession>> = self.inner.table().sessions.clone();
        for session in sessions.iter().rev() {
            if !self.inner.mcp.is_faulted() {
                if let Err(e) = self.inner.close_session(session.id()) {
                    warn!(session_id = %session.id(), error = %e, "monitor did not close session");
                }
            }
            self.inner.remove_session(session.id());
        }
        self.inner.shutdown.store(true, Ordering::SeqCst);

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if worker.join().is_err() {
                error!(%device_id, "device worker panicked");
            }
        }

        let donated = std::mem::take(
            &mut *self
                .inner
                .donated
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for buffer in donated {
            if let Err(e) = self.inner.driver.free_wsm(buffer.handle) {
                warn!(handle = %buffer.handle, error = %e, "failed to free donated RAM");
            }
        }
        info!(%device_id, "device stopped");
    }
}

impl Drop for TrustZoneDevice {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let _ = worker.join();
        }
    }
}
