//! Shared-memory mailbox between the normal and secure worlds.
//!
//! The mailbox is a single word array mapped into both worlds:
//!
//! ```text
//! +---------------------------+---------------------------+--------------+
//! | ring A (monitor -> daemon)| ring B (daemon -> monitor)| MCP buffer   |
//! | header + NQ_CAPACITY items| header + NQ_CAPACITY items| 64 words     |
//! +---------------------------+---------------------------+--------------+
//! ```
//!
//! Each ring is a [`NotificationQueue`] with a single producer and a single
//! consumer living in different worlds. [`Side`] selects which ring a view
//! reads from: the daemon reads ring A and writes ring B, the monitor does
//! the opposite.
//!
//! # Invariants
//!
//! - The region is at least [`MAILBOX_WORDS`] words long; [`Mailbox::attach`]
//!   refuses shorter regions so ring and buffer accesses stay in bounds
//! - Ring counters only ever grow (wrapping) and
//!   `write_count - read_count <= NQ_CAPACITY`

mod queue;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub use self::queue::NotificationQueue;
use crate::mcp::{MCP_BUFFER_SIZE, MCP_BUFFER_WORDS};

/// Items per notification ring.
pub const NQ_CAPACITY: u32 = 16;

const _: () = assert!(NQ_CAPACITY.is_power_of_two());

/// Words in a ring header: write count, read count, capacity, reserved.
pub const RING_HEADER_WORDS: usize = 4;

/// Words per ring item: session id, payload.
pub const RING_ITEM_WORDS: usize = 2;

/// Words occupied by one ring.
pub const RING_WORDS: usize = RING_HEADER_WORDS + NQ_CAPACITY as usize * RING_ITEM_WORDS;

/// Word offset of the MCP buffer.
pub const MCP_OFFSET_WORDS: usize = 2 * RING_WORDS;

/// Total words in a mailbox.
pub const MAILBOX_WORDS: usize = MCP_OFFSET_WORDS + MCP_BUFFER_WORDS;

/// Mailbox errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// The mapped region cannot hold a mailbox.
    #[error("mailbox region too small: need {needed} words, got {actual}")]
    TooSmall {
        /// Required words.
        needed: usize,
        /// Words mapped.
        actual: usize,
    },

    /// An MCP message does not fit the MCP buffer.
    #[error("MCP message of {len} bytes exceeds the {max}-byte buffer")]
    MessageTooLarge {
        /// Message length.
        len: usize,
        /// Buffer size.
        max: usize,
    },
}

/// Memory shared between the two worlds, viewed as 32-bit words.
pub trait SharedWords: Send + Sync {
    /// The shared words.
    fn words(&self) -> &[AtomicU32];

    /// Physical address of the first word, as seen by the secure world.
    fn phys_addr(&self) -> u64;
}

/// Heap-backed shared words, used when both worlds share an address space.
pub struct HeapWords {
    words: Box<[AtomicU32]>,
    phys_addr: u64,
}

impl HeapWords {
    /// Allocates `len` zeroed words reported at `phys_addr`.
    #[must_use]
    pub fn new(len: usize, phys_addr: u64) -> Self {
        Self {
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
            phys_addr,
        }
    }
}

impl SharedWords for HeapWords {
    fn words(&self) -> &[AtomicU32] {
        &self.words
    }

    fn phys_addr(&self) -> u64 {
        self.phys_addr
    }
}

impl fmt::Debug for HeapWords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapWords")
            .field("len", &self.words.len())
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .finish()
    }
}

/// Which world a mailbox view belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The daemon: reads ring A, writes ring B.
    Normal,
    /// The secure monitor: reads ring B, writes ring A.
    Secure,
}

/// Byte offsets handed to the secure monitor at initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxLayout {
    /// Physical address of the mailbox.
    pub phys_addr: u64,
    /// Offset of the notification rings.
    pub nq_offset: usize,
    /// Length of both rings.
    pub nq_len: usize,
    /// Offset of the MCP buffer.
    pub mcp_offset: usize,
    /// Length of the MCP buffer.
    pub mcp_len: usize,
}

/// One world's view of the mailbox.
pub struct Mailbox {
    region: Arc<dyn SharedWords>,
    inbound: NotificationQueue,
    outbound: NotificationQueue,
    mcp: McpBuffer,
}

impl Mailbox {
    /// Attaches a view to a mapped region.
    ///
    /// # Errors
    ///
    /// Returns [`MailboxError::TooSmall`] if the region is shorter than
    /// [`MAILBOX_WORDS`].
    pub fn attach(region: Arc<dyn SharedWords>, side: Side) -> Result<Self, MailboxError> {
        let actual = region.words().len();
        if actual < MAILBOX_WORDS {
            return Err(MailboxError::TooSmall {
                needed: MAILBOX_WORDS,
                actual,
            });
        }
        let ring_a = 0;
        let ring_b = RING_WORDS;
        let (inbound, outbound) = match side {
            Side::Normal => (ring_a, ring_b),
            Side::Secure => (ring_b, ring_a),
        };
        Ok(Self {
            inbound: NotificationQueue::new(Arc::clone(&region), inbound),
            outbound: NotificationQueue::new(Arc::clone(&region), outbound),
            mcp: McpBuffer {
                region: Arc::clone(&region),
            },
            region,
        })
    }

    /// Resets both rings and clears the MCP buffer.
    ///
    /// Only the side that owns initialisation (the daemon) calls this,
    /// before the layout is handed to the monitor.
    pub fn format(&self) {
        self.inbound.reset();
        self.outbound.reset();
        self.mcp.clear();
    }

    /// Ring this side consumes.
    #[must_use]
    pub const fn inbound(&self) -> &NotificationQueue {
        &self.inbound
    }

    /// Ring this side produces into.
    #[must_use]
    pub const fn outbound(&self) -> &NotificationQueue {
        &self.outbound
    }

    /// The MCP buffer.
    #[must_use]
    pub const fn mcp(&self) -> &McpBuffer {
        &self.mcp
    }

    /// Offsets of the rings and MCP buffer.
    #[must_use]
    pub fn layout(&self) -> MailboxLayout {
        MailboxLayout {
            phys_addr: self.region.phys_addr(),
            nq_offset: 0,
            nq_len: 2 * RING_WORDS * 4,
            mcp_offset: MCP_OFFSET_WORDS * 4,
            mcp_len: MCP_BUFFER_SIZE,
        }
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

/// The MCP message buffer.
///
/// Access is serialised by the MCP protocol itself: only the side that was
/// last notified touches the buffer.
pub struct McpBuffer {
    region: Arc<dyn SharedWords>,
}

impl McpBuffer {
    /// Writes a message, zero-filling the rest of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`MailboxError::MessageTooLarge`] if `message` exceeds
    /// [`MCP_BUFFER_SIZE`].
    pub fn write(&self, message: &[u8]) -> Result<(), MailboxError> {
        if message.len() > MCP_BUFFER_SIZE {
            return Err(MailboxError::MessageTooLarge {
                len: message.len(),
                max: MCP_BUFFER_SIZE,
            });
        }
        let words = &self.region.words()[MCP_OFFSET_WORDS..MCP_OFFSET_WORDS + MCP_BUFFER_WORDS];
        let mut chunks = message.chunks(4);
        for word in words {
            let value = chunks.next().map_or(0, |chunk| {
                let mut raw = [0u8; 4];
                raw[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(raw)
            });
            word.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Reads the whole buffer.
    #[must_use]
    pub fn read(&self) -> Bytes {
        let words = &self.region.words()[MCP_OFFSET_WORDS..MCP_OFFSET_WORDS + MCP_BUFFER_WORDS];
        let mut buf = BytesMut::with_capacity(MCP_BUFFER_SIZE);
        for word in words {
            buf.put_u32_le(word.load(Ordering::Relaxed));
        }
        buf.freeze()
    }

    fn clear(&self) {
        for word in &self.region.words()[MCP_OFFSET_WORDS..MCP_OFFSET_WORDS + MCP_BUFFER_WORDS] {
            word.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Notification, SessionId};

    fn region() -> Arc<dyn SharedWords> {
        Arc::new(HeapWords::new(MAILBOX_WORDS, 0x4000_0000))
    }

    #[test]
    fn rejects_short_region() {
        let short: Arc<dyn SharedWords> = Arc::new(HeapWords::new(MAILBOX_WORDS - 1, 0));
        let err = Mailbox::attach(short, Side::Normal).unwrap_err();
        assert_eq!(
            err,
            MailboxError::TooSmall {
                needed: MAILBOX_WORDS,
                actual: MAILBOX_WORDS - 1,
            }
        );
    }

    #[test]
    fn sides_see_opposite_rings() {
        let region = region();
        let normal = Mailbox::attach(Arc::clone(&region), Side::Normal).unwrap();
        let secure = Mailbox::attach(region, Side::Secure).unwrap();
        normal.format();

        let to_monitor = Notification::new(SessionId::new(0), 0);
        assert!(normal.outbound().put(to_monitor));
        assert_eq!(secure.inbound().get(), Some(to_monitor));
        assert_eq!(normal.inbound().get(), None);

        let to_daemon = Notification::new(SessionId::new(5), -1);
        assert!(secure.outbound().put(to_daemon));
        assert_eq!(normal.inbound().get(), Some(to_daemon));
    }

    #[test]
    fn mcp_buffer_roundtrip_and_padding() {
        let region = region();
        let normal = Mailbox::attach(Arc::clone(&region), Side::Normal).unwrap();
        let secure = Mailbox::attach(region, Side::Secure).unwrap();

        normal.mcp().write(&[0xFF; 40]).unwrap();
        normal.mcp().write(&[1, 2, 3, 4, 5]).unwrap();
        let seen = secure.mcp().read();
        assert_eq!(seen.len(), MCP_BUFFER_SIZE);
        assert_eq!(&seen[..5], &[1, 2, 3, 4, 5]);
        assert!(seen[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn mcp_buffer_rejects_oversized_message() {
        let mailbox = Mailbox::attach(region(), Side::Normal).unwrap();
        let err = mailbox.mcp().write(&[0; MCP_BUFFER_SIZE + 1]).unwrap_err();
        assert!(matches!(err, MailboxError::MessageTooLarge { .. }));
    }

    #[test]
    fn layout_offsets() {
        let mailbox = Mailbox::attach(region(), Side::Normal).unwrap();
        let layout = mailbox.layout();
        assert_eq!(layout.phys_addr, 0x4000_0000);
        assert_eq!(layout.mcp_offset, layout.nq_offset + layout.nq_len);
        assert_eq!(layout.mcp_len, 256);
    }
}
