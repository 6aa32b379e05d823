//! ryuldn_bridge/src/lib.rs
//! Virtualized LAN bridge for LDN-based multiplayer emulation: a framed wire
//! protocol, a master-relay session client, and a BSD-socket-shaped virtual
//! router, exposed to the host process through a small FFI surface.

pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod ffi;
pub mod interposer;
pub mod logging;
pub mod master_client;
pub mod orchestrator;
pub mod peer;
pub mod ports;
pub mod protocol;
pub mod router;
pub mod socket;
pub mod state;
pub mod upnp;
