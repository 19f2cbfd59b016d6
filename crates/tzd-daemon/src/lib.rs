//! tzd-daemon - trustlet session broker.
//!
//! Brokers sessions between normal-world client processes and trustlets
//! running inside a secure monitor:
//!
//! - [`connection`]: stream and datagram (netlink) client connections
//! - [`server`]: the listener event loops
//! - [`daemon`]: the client command processor
//! - [`device`]: secure-world devices and the MCP control channel
//! - [`session`]: per-session bulk buffers and notification delivery
//! - [`state`]: the process-wide context shared by all of the above
//!
//! # Threads
//!
//! One event loop per listener, one interrupt thread per device and an
//! optional scheduler thread per device. Client connections never get a
//! thread of their own.

#![allow(clippy::doc_markdown)]

pub mod connection;
pub mod daemon;
pub mod device;
pub mod server;
pub mod session;
pub mod state;
