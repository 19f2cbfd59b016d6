//! Trustlet sessions.
//!
//! A [`Session`] tracks the client buffers mapped into one trustlet. A
//! [`TrustletSession`] adds what the daemon needs to serve a client: the
//! owning connection, the credentials a notification connection must
//! present, the locked TCI buffer, and the notification channel.
//!
//! # Notification channel
//!
//! Notifications for a session may arrive before the client has attached
//! its notification connection. They are queued (bounded) and flushed, in
//! arrival order, when the connection attaches. Queueing, flushing and
//! direct delivery all happen under one lock, so a notification is never
//! reordered or delivered twice.
//!
//! # Invariants
//!
//! - No two bulk buffers of a session share a normal-world virtual address
//! - Teardown leaves no bulk buffer registered and the TCI unlocked

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use tzd_core::driver::KernelDriver;
use tzd_core::wire::WireMessage;
use tzd_core::{DeviceId, Notification, SessionId, SharedBuffer, WsmHandle};

use crate::connection::{ConnectionId, SharedConnection};

/// Bulk buffer bookkeeping errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A buffer with the same handle or virtual address is already mapped.
    #[error("buffer {handle} at {virt_addr:#x} is already mapped")]
    AlreadyMapped {
        /// Handle of the rejected buffer.
        handle: WsmHandle,
        /// Its virtual address.
        virt_addr: usize,
    },

    /// No buffer with this handle.
    #[error("bulk buffer {0} not found")]
    NotFound(WsmHandle),

    /// The trustlet address or length does not describe this buffer's
    /// mapping.
    #[error("buffer {handle} is not mapped at {secure_virtual_addr:#x} with length {len}")]
    MappingMismatch {
        /// Handle named by the request.
        handle: WsmHandle,
        /// Trustlet address named by the request.
        secure_virtual_addr: u32,
        /// Length named by the request.
        len: u32,
    },
}

/// A client buffer mapped into a trustlet.
#[derive(Debug, Clone)]
pub struct BulkBuffer {
    /// Driver registration of the buffer.
    pub buffer: SharedBuffer,
    /// Payload offset within the first page.
    pub offset: u32,
    /// Payload length.
    pub len: u32,
    /// Address inside the trustlet, once the monitor has mapped it.
    pub secure_virtual_addr: Option<u32>,
    locked: bool,
    backing: Option<Arc<[u8]>>,
}

impl BulkBuffer {
    /// Creates an entry for a registered buffer.
    #[must_use]
    pub const fn new(buffer: SharedBuffer, offset: u32, len: u32) -> Self {
        Self {
            buffer,
            offset,
            len,
            secure_virtual_addr: None,
            locked: false,
            backing: None,
        }
    }

    /// Marks the buffer as locked with the driver on the session's behalf;
    /// teardown unlocks it before unregistering.
    #[must_use]
    pub const fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Whether the session holds a driver lock on the buffer.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Keeps `backing` alive for as long as the entry exists; used for
    /// daemon-owned memory such as trustlet images.
    #[must_use]
    pub fn with_backing(mut self, backing: Arc<[u8]>) -> Self {
        self.backing = Some(backing);
        self
    }

    /// Driver handle.
    #[must_use]
    pub const fn handle(&self) -> WsmHandle {
        self.buffer.handle
    }

    /// Normal-world virtual address.
    #[must_use]
    pub const fn virt_addr(&self) -> usize {
        self.buffer.virt_addr
    }
}

/// Buffers mapped into one trustlet session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    device_id: DeviceId,
    bulk: Mutex<BTreeMap<WsmHandle, BulkBuffer>>,
}

impl Session {
    /// Creates a session with no buffers.
    #[must_use]
    pub const fn new(id: SessionId, device_id: DeviceId) -> Self {
        Self {
            id,
            device_id,
            bulk: Mutex::new(BTreeMap::new()),
        }
    }

    /// Session id assigned by the monitor.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Device the session lives on.
    #[must_use]
    pub const fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn bulk(&self) -> MutexGuard<'_, BTreeMap<WsmHandle, BulkBuffer>> {
        self.bulk.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyMapped`] if the handle or the virtual
    /// address is already present.
    pub fn add_bulk_buffer(&self, buffer: BulkBuffer) -> Result<(), SessionError> {
        let mut bulk = self.bulk();
        let clash = bulk.contains_key(&buffer.handle())
            || bulk
                .values()
                .any(|existing| existing.virt_addr() == buffer.virt_addr());
        if clash {
            return Err(SessionError::AlreadyMapped {
                handle: buffer.handle(),
                virt_addr: buffer.virt_addr(),
            });
        }
        bulk.insert(buffer.handle(), buffer);
        Ok(())
    }

    /// Removes a buffer and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no buffer has this handle.
    pub fn remove_bulk_buffer(&self, handle: WsmHandle) -> Result<BulkBuffer, SessionError> {
        self.bulk()
            .remove(&handle)
            .ok_or(SessionError::NotFound(handle))
    }

    /// Records the trustlet address of a mapped buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no buffer has this handle.
    pub fn set_secure_address(
        &self,
        handle: WsmHandle,
        secure_virtual_addr: u32,
    ) -> Result<(), SessionError> {
        let mut bulk = self.bulk();
        let entry = bulk.get_mut(&handle).ok_or(SessionError::NotFound(handle))?;
        entry.secure_virtual_addr = Some(secure_virtual_addr);
        Ok(())
    }

    /// Checks that `handle` is mapped at `secure_virtual_addr` with
    /// length `len`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] for an unknown handle and
    /// [`SessionError::MappingMismatch`] when the mapping differs.
    pub fn check_mapping(
        &self,
        handle: WsmHandle,
        secure_virtual_addr: u32,
        len: u32,
    ) -> Result<(), SessionError> {
        let bulk = self.bulk();
        let entry = bulk.get(&handle).ok_or(SessionError::NotFound(handle))?;
        if entry.secure_virtual_addr != Some(secure_virtual_addr) || entry.len != len {
            return Err(SessionError::MappingMismatch {
                handle,
                secure_virtual_addr,
                len,
            });
        }
        Ok(())
    }

    /// Looks up a buffer.
    #[must_use]
    pub fn bulk_buffer(&self, handle: WsmHandle) -> Option<BulkBuffer> {
        self.bulk().get(&handle).cloned()
    }

    /// Removes and returns some buffer, or `None` when empty.
    pub fn pop_any_buffer(&self) -> Option<BulkBuffer> {
        self.bulk().pop_first().map(|(_, buffer)| buffer)
    }

    /// Number of buffers.
    #[must_use]
    pub fn bulk_count(&self) -> usize {
        self.bulk().len()
    }
}

/// Construction parameters of a [`TrustletSession`].
#[derive(Debug, Clone, Copy)]
pub struct TrustletSessionParams {
    /// Monitor-assigned session id.
    pub session_id: SessionId,
    /// Device the session lives on.
    pub device_id: DeviceId,
    /// Daemon-assigned session number.
    pub device_session_id: u32,
    /// Random value the notification connection must present.
    pub magic: u32,
    /// Connection that opened the session.
    pub owner: ConnectionId,
    /// TCI buffer, locked for the session's lifetime.
    pub tci_handle: WsmHandle,
    /// Notifications held while no notification connection is attached.
    pub max_queued_notifications: usize,
    /// Bound on one write to the notification connection.
    pub notification_write_timeout: Duration,
}

#[derive(Debug, Default)]
struct NotificationChannel {
    connection: Option<SharedConnection>,
    queued: VecDeque<Notification>,
}

/// A session as the daemon serves it.
pub struct TrustletSession {
    session: Session,
    device_session_id: u32,
    magic: u32,
    owner: ConnectionId,
    tci_handle: WsmHandle,
    max_queued: usize,
    write_timeout: Duration,
    channel: Mutex<NotificationChannel>,
}

impl TrustletSession {
    /// Creates a session with no notification connection.
    #[must_use]
    pub fn new(params: TrustletSessionParams) -> Self {
        Self {
            session: Session::new(params.session_id, params.device_id),
            device_session_id: params.device_session_id,
            magic: params.magic,
            owner: params.owner,
            tci_handle: params.tci_handle,
            max_queued: params.max_queued_notifications,
            write_timeout: params.notification_write_timeout,
            channel: Mutex::new(NotificationChannel::default()),
        }
    }

    /// Bulk buffer bookkeeping.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Monitor-assigned session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.session.id()
    }

    /// Daemon-assigned session number.
    #[must_use]
    pub const fn device_session_id(&self) -> u32 {
        self.device_session_id
    }

    /// Session magic.
    #[must_use]
    pub const fn magic(&self) -> u32 {
        self.magic
    }

    /// Connection that opened the session.
    #[must_use]
    pub const fn owner(&self) -> ConnectionId {
        self.owner
    }

    /// Locked TCI buffer.
    #[must_use]
    pub const fn tci_handle(&self) -> WsmHandle {
        self.tci_handle
    }

    /// Whether the three credentials all match.
    #[must_use]
    pub fn matches(&self, device_session_id: u32, session_id: SessionId, magic: u32) -> bool {
        self.device_session_id == device_session_id && self.id() == session_id && self.magic == magic
    }

    fn channel(&self) -> MutexGuard<'_, NotificationChannel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a notification connection is attached.
    #[must_use]
    pub fn has_notification_connection(&self) -> bool {
        self.channel().connection.is_some()
    }

    /// Notifications waiting for a connection.
    #[must_use]
    pub fn queued_notifications(&self) -> usize {
        self.channel().queued.len()
    }

    /// Queues a notification for later delivery.
    ///
    /// Returns `false`, dropping the notification, when the queue is full.
    pub fn queue_notification(&self, notification: Notification) -> bool {
        Self::enqueue(&mut self.channel(), notification, self.max_queued, self.id())
    }

    fn enqueue(
        channel: &mut NotificationChannel,
        notification: Notification,
        max_queued: usize,
        session_id: SessionId,
    ) -> bool {
        if channel.queued.len() >= max_queued {
            warn!(%session_id, max_queued, "notification queue full, dropping notification");
            return false;
        }
        channel.queued.push_back(notification);
        true
    }

    /// Attaches the notification connection and flushes the queue over it.
    ///
    /// Writes to the connection are bounded from here on: notifications
    /// are written by the interrupt thread, and a peer that stops reading
    /// gets its connection dropped instead of stalling the device.
    ///
    /// `ack` is written first, so a client sees it ahead of any queued
    /// notification. Returns `false`, leaving the session unchanged, if
    /// that write fails. A previously attached connection is shut down.
    pub fn attach_notification_connection(
        &self,
        connection: SharedConnection,
        ack: &[u8],
    ) -> bool {
        if let Err(e) = connection.set_write_timeout(self.write_timeout) {
            warn!(
                session_id = %self.id(),
                connection = %connection.id(),
                error = %e,
                "cannot bound notification writes"
            );
            return false;
        }
        let mut channel = self.channel();
        if !ack.is_empty() {
            if let Err(e) = connection.write(ack) {
                warn!(
                    session_id = %self.id(),
                    connection = %connection.id(),
                    error = %e,
                    "notification connection failed during attach"
                );
                return false;
            }
        }
        if let Some(previous) = channel.connection.replace(connection) {
            warn!(session_id = %self.id(), previous = %previous.id(), "replacing notification connection");
            previous.shutdown();
        }
        let flushed = Self::flush(&mut channel, self.id());
        debug!(session_id = %self.id(), flushed, "notification connection attached");
        true
    }

    /// Delivers queued notifications over the attached connection.
    ///
    /// Returns the number delivered; 0 when no connection is attached.
    pub fn flush_queued_notifications(&self) -> usize {
        Self::flush(&mut self.channel(), self.id())
    }

    fn flush(channel: &mut NotificationChannel, session_id: SessionId) -> usize {
        let mut delivered = 0;
        while let Some(notification) = channel.queued.front().copied() {
            let Some(connection) = channel.connection.as_ref() else {
                break;
            };
            if let Err(e) = connection.write(&notification.encode()) {
                warn!(%session_id, error = %e, "notification connection failed, keeping queue");
                Self::drop_connection(channel);
                break;
            }
            channel.queued.pop_front();
            delivered += 1;
        }
        delivered
    }

    fn drop_connection(channel: &mut NotificationChannel) {
        if let Some(connection) = channel.connection.take() {
            connection.shutdown();
        }
    }

    /// Delivers a notification now, or queues it if no connection is
    /// attached.
    ///
    /// Returns `false` if the notification was dropped.
    pub fn deliver(&self, notification: Notification) -> bool {
        let mut channel = self.channel();
        if channel.connection.is_some() && channel.queued.is_empty() {
            let written = channel
                .connection
                .as_ref()
                .map(|connection| connection.write(&notification.encode()));
            match written {
                Some(Ok(_)) => return true,
                Some(Err(e)) => {
                    warn!(session_id = %self.id(), error = %e, "notification connection failed");
                    Self::drop_connection(&mut channel);
                },
                None => {},
            }
        }
        let queued = Self::enqueue(&mut channel, notification, self.max_queued, self.id());
        Self::flush(&mut channel, self.id());
        queued
    }

    /// Releases everything the session holds: unregisters every bulk
    /// buffer, unlocks the TCI and closes the notification connection.
    ///
    /// Failures are logged and do not stop the teardown.
    pub fn teardown(&self, driver: &dyn KernelDriver) {
        while let Some(buffer) = self.session.pop_any_buffer() {
            if buffer.is_locked() {
                if let Err(e) = driver.unlock_wsm(buffer.handle()) {
                    warn!(session_id = %self.id(), handle = %buffer.handle(), error = %e, "failed to unlock bulk buffer");
                }
            }
            if let Err(e) = driver.unregister_wsm(buffer.handle()) {
                warn!(session_id = %self.id(), handle = %buffer.handle(), error = %e, "failed to unregister bulk buffer");
            }
        }
        if let Err(e) = driver.unlock_wsm(self.tci_handle) {
            warn!(session_id = %self.id(), handle = %self.tci_handle, error = %e, "failed to unlock TCI");
        }
        let mut channel = self.channel();
        Self::drop_connection(&mut channel);
        if !channel.queued.is_empty() {
            debug!(session_id = %self.id(), dropped = channel.queued.len(), "discarding undelivered notifications");
            channel.queued.clear();
        }
    }
}

impl fmt::Debug for TrustletSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustletSession")
            .field("id", &self.id())
            .field("device_session_id", &self.device_session_id)
            .field("owner", &self.owner)
            .field("tci_handle", &self.tci_handle)
            .field("bulk_buffers", &self.session.bulk_count())
            .finish_non_exhaustive()
    }
}
