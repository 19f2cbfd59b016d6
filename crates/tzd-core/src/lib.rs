//! tzd-core - shared building blocks of the tzd trustlet broker.
//!
//! This crate holds everything the broker needs that does not own a thread:
//!
//! - [`types`]: identifiers, notifications and world-shared memory handles
//! - [`wire`]: the fixed-layout client protocol spoken on the local sockets
//! - [`mcp`]: the control protocol exchanged with the secure monitor
//! - [`mailbox`]: the shared-memory notification rings and MCP buffer
//! - [`driver`]: the kernel-driver collaborator trait
//! - [`registry`]: trustlet image lookup
//! - [`config`]: the daemon configuration file
//! - [`emulator`]: an in-process secure monitor implementing
//!   [`driver::KernelDriver`]
//!
//! The running daemon (listeners, devices, sessions) lives in `tzd-daemon`.

#![allow(clippy::doc_markdown)]

pub mod config;
pub mod driver;
pub mod emulator;
pub mod mailbox;
pub mod mcp;
pub mod registry;
pub mod types;
pub mod wire;

pub use types::{DeviceId, Notification, SID_MCP, SessionId, SharedBuffer, WsmHandle};

/// Daemon protocol major version.
pub const DAEMON_VERSION_MAJOR: u32 = 0;

/// Daemon protocol minor version.
pub const DAEMON_VERSION_MINOR: u32 = 1;

/// Version reported to clients by `GET_VERSION`: major in the upper 16
/// bits, minor in the lower 16 bits.
pub const DAEMON_VERSION: u32 = (DAEMON_VERSION_MAJOR << 16) | DAEMON_VERSION_MINOR;
