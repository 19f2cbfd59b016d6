//! Single-producer single-consumer notification ring.
//!
//! The ring lives in shared memory. The producer writes the item words and
//! then publishes them with a Release store of `write_count`; the consumer
//! Acquire-loads `write_count` before reading the item and hands the slot
//! back with a Release store of `read_count`. Counters wrap; the slot index
//! is `count & (NQ_CAPACITY - 1)`.
//!
//! Several daemon threads may produce into the same ring, so each view
//! serialises its own callers with a local mutex. The other world never
//! takes that lock.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{NQ_CAPACITY, RING_HEADER_WORDS, RING_ITEM_WORDS, SharedWords};
use crate::types::{Notification, SessionId};

const WRITE_COUNT: usize = 0;
const READ_COUNT: usize = 1;
const CAPACITY: usize = 2;

/// One world's handle on a notification ring.
pub struct NotificationQueue {
    region: Arc<dyn SharedWords>,
    base: usize,
    lock: Mutex<()>,
}

impl NotificationQueue {
    pub(super) fn new(region: Arc<dyn SharedWords>, base: usize) -> Self {
        Self {
            region,
            base,
            lock: Mutex::new(()),
        }
    }

    fn word(&self, index: usize) -> &AtomicU32 {
        &self.region.words()[self.base + index]
    }

    fn slot(&self, count: u32) -> usize {
        let index = (count & (NQ_CAPACITY - 1)) as usize;
        RING_HEADER_WORDS + index * RING_ITEM_WORDS
    }

    pub(super) fn reset(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.word(WRITE_COUNT).store(0, Ordering::Relaxed);
        self.word(READ_COUNT).store(0, Ordering::Relaxed);
        self.word(CAPACITY).store(NQ_CAPACITY, Ordering::Relaxed);
        for slot in 0..NQ_CAPACITY {
            let base = self.slot(slot);
            self.word(base).store(0, Ordering::Relaxed);
            self.word(base + 1).store(0, Ordering::Relaxed);
        }
    }

    /// Appends a notification.
    ///
    /// Returns `false`, leaving the ring untouched, when the ring is full.
    pub fn put(&self, notification: Notification) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let write = self.word(WRITE_COUNT).load(Ordering::Relaxed);
        let read = self.word(READ_COUNT).load(Ordering::Acquire);
        if write.wrapping_sub(read) >= NQ_CAPACITY {
            return false;
        }
        let slot = self.slot(write);
        self.word(slot)
            .store(notification.session_id.as_u32(), Ordering::Relaxed);
        self.word(slot + 1).store(
            u32::from_ne_bytes(notification.payload.to_ne_bytes()),
            Ordering::Relaxed,
        );
        self.word(WRITE_COUNT)
            .store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// Removes the oldest notification, if any.
    pub fn get(&self) -> Option<Notification> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let read = self.word(READ_COUNT).load(Ordering::Relaxed);
        let write = self.word(WRITE_COUNT).load(Ordering::Acquire);
        if write == read {
            return None;
        }
        let slot = self.slot(read);
        let notification = Notification::new(
            SessionId::new(self.word(slot).load(Ordering::Relaxed)),
            i32::from_ne_bytes(self.word(slot + 1).load(Ordering::Relaxed).to_ne_bytes()),
        );
        self.word(READ_COUNT)
            .store(read.wrapping_add(1), Ordering::Release);
        Some(notification)
    }

    /// Total notifications ever produced (wrapping).
    #[must_use]
    pub fn write_count(&self) -> u32 {
        self.word(WRITE_COUNT).load(Ordering::Acquire)
    }

    /// Total notifications ever consumed (wrapping).
    #[must_use]
    pub fn read_count(&self) -> u32 {
        self.word(READ_COUNT).load(Ordering::Acquire)
    }

    /// Notifications currently queued.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.write_count().wrapping_sub(self.read_count())
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ring capacity.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        NQ_CAPACITY
    }
}

impl fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationQueue")
            .field("base", &self.base)
            .field("write_count", &self.write_count())
            .field("read_count", &self.read_count())
            .finish()
    }
}
