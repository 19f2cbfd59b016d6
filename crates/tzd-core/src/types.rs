//! Identifiers and small value types shared by every layer.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Wraps a raw identifier.
            #[must_use]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Returns the raw identifier.
            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a secure-world device (one per mailbox).
    DeviceId,
    "device#"
);

id_type!(
    /// Session identifier assigned by the secure monitor.
    ///
    /// Session id 0 is reserved for the monitor control protocol, see
    /// [`SID_MCP`].
    SessionId,
    "session#"
);

id_type!(
    /// Handle of a world-shared memory registration held by the kernel
    /// driver.
    WsmHandle,
    "wsm#"
);

/// Session id used on the notification rings to signal "the MCP buffer
/// holds a message".
pub const SID_MCP: SessionId = SessionId::new(0);

/// A notification travelling between the two worlds or to a client.
///
/// The payload is a signed status word; trustlet notifications carry 0 and
/// negative values report session-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Notification {
    /// Session the notification targets.
    pub session_id: SessionId,
    /// Status word.
    pub payload: i32,
}

impl Notification {
    /// Creates a notification.
    #[must_use]
    pub const fn new(session_id: SessionId, payload: i32) -> Self {
        Self {
            session_id,
            payload,
        }
    }

    /// Returns `true` if this notification belongs to the MCP channel.
    #[must_use]
    pub const fn is_mcp(&self) -> bool {
        self.session_id.as_u32() == SID_MCP.as_u32()
    }
}

/// A world-shared memory region known to the kernel driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedBuffer {
    /// Driver handle.
    pub handle: WsmHandle,
    /// Normal-world virtual address of the region.
    pub virt_addr: usize,
    /// Physical address the secure world uses to reach the region (the
    /// page table for scattered registrations, the base for contiguous
    /// allocations).
    pub phys_addr: u64,
    /// Length in bytes.
    pub len: usize,
}

/// Version block reported by the secure monitor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonitorVersion {
    /// Product identification string, at most
    /// [`MonitorVersion::PRODUCT_ID_LEN`] bytes.
    pub product_id: String,
    /// Control interface version.
    pub mci: u32,
    /// Secure object version.
    pub so: u32,
    /// Trustlet image format version.
    pub mclf: u32,
    /// Container format version.
    pub container: u32,
    /// Monitor configuration version.
    pub mc_config: u32,
    /// Trustlet API version.
    pub tl_api: u32,
    /// Driver API version.
    pub dr_api: u32,
    /// Command protocol version.
    pub cmp: u32,
}

impl MonitorVersion {
    /// Fixed size of the product id field on the wire.
    pub const PRODUCT_ID_LEN: usize = 64;

    /// Encoded size of the version block.
    pub const ENCODED_LEN: usize = Self::PRODUCT_ID_LEN + 8 * 4;

    /// Writes the version block in its fixed little-endian layout.
    ///
    /// Product ids longer than [`Self::PRODUCT_ID_LEN`] bytes are truncated;
    /// shorter ones are NUL padded.
    pub fn write_to(&self, buf: &mut impl bytes::BufMut) {
        let mut product = [0u8; Self::PRODUCT_ID_LEN];
        let raw = self.product_id.as_bytes();
        let n = raw.len().min(Self::PRODUCT_ID_LEN);
        product[..n].copy_from_slice(&raw[..n]);
        buf.put_slice(&product);
        for word in [
            self.mci,
            self.so,
            self.mclf,
            self.container,
            self.mc_config,
            self.tl_api,
            self.dr_api,
            self.cmp,
        ] {
            buf.put_u32_le(word);
        }
    }

    /// Reads a version block; the caller guarantees
    /// [`Self::ENCODED_LEN`] bytes are available.
    pub fn read_from(buf: &mut impl bytes::Buf) -> Self {
        let mut product = [0u8; Self::PRODUCT_ID_LEN];
        buf.copy_to_slice(&mut product);
        let end = product.iter().position(|&b| b == 0).unwrap_or(product.len());
        Self {
            product_id: String::from_utf8_lossy(&product[..end]).into_owned(),
            mci: buf.get_u32_le(),
            so: buf.get_u32_le(),
            mclf: buf.get_u32_le(),
            container: buf.get_u32_le(),
            mc_config: buf.get_u32_le(),
            tl_api: buf.get_u32_le(),
            dr_api: buf.get_u32_le(),
            cmp: buf.get_u32_le(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn sid_mcp_is_zero() {
        assert_eq!(SID_MCP.as_u32(), 0);
        assert!(Notification::new(SID_MCP, 0).is_mcp());
        assert!(!Notification::new(SessionId::new(7), 0).is_mcp());
    }

    #[test]
    fn id_display() {
        assert_eq!(SessionId::new(3).to_string(), "session#3");
        assert_eq!(DeviceId::new(0).to_string(), "device#0");
        assert_eq!(WsmHandle::new(12).to_string(), "wsm#12");
    }

    #[test]
    fn monitor_version_truncates_long_product_id() {
        let version = MonitorVersion {
            product_id: "x".repeat(100),
            cmp: 9,
            ..MonitorVersion::default()
        };
        let mut buf = BytesMut::new();
        version.write_to(&mut buf);
        assert_eq!(buf.len(), MonitorVersion::ENCODED_LEN);

        let decoded = MonitorVersion::read_from(&mut buf.freeze());
        assert_eq!(decoded.product_id.len(), MonitorVersion::PRODUCT_ID_LEN);
        assert_eq!(decoded.cmp, 9);
    }
}
