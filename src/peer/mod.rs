//! ryuldn_bridge/src/peer/mod.rs
//! Peer-hosted relay: a session host forwards proxy traffic directly between
//! peers instead of going through the master relay (sec. 4.8/4.9).

pub mod client;
pub mod server;
pub mod session;
