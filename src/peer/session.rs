//! ryuldn_bridge/src/peer/session.rs
//! One peer-relay session (sec. 4.8), grounded on `p2p_proxy_server.hpp`'s
//! per-client slot: owns the accepted TCP stream, runs a dedicated protocol
//! parser, and authenticates the peer via `ExternalProxyToken` before
//! joining the session's virtual-IP registry.

use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::buffer_pool::BufferPool;
use crate::error::Result;
use crate::protocol::codec::{self, Decoder, Frame};
use crate::protocol::types::*;

pub struct Session {
    write_half: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pub virtual_ip: std::sync::atomic::AtomicU32,
    pub authenticated: std::sync::atomic::AtomicBool,
}

impl Session {
    pub fn new(write_half: tokio::net::tcp::OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Session {
            write_half: Mutex::new(write_half),
            virtual_ip: std::sync::atomic::AtomicU32::new(0),
            authenticated: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut w = self.write_half.lock().await;
        w.write_all(bytes).await?;
        Ok(())
    }

    pub async fn send_proxy_data(&self, info: &ProxyInfo, payload: &[u8]) -> Result<()> {
        let mut out = Vec::new();
        codec::encode_proxy_data(info, payload, &mut out);
        self.send_raw(&out).await
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn virtual_ip_addr(&self) -> Option<std::net::Ipv4Addr> {
        let ip = self.virtual_ip.load(std::sync::atomic::Ordering::Acquire);
        if ip == 0 {
            None
        } else {
            Some(std::net::Ipv4Addr::from(ip))
        }
    }
}

/// Splits an accepted stream into a `Session` (owning the write half) and a
/// receive loop future that feeds decoded frames to `on_frame` until the
/// peer disconnects or sends a malformed frame — matching the reference's
/// per-client receive thread.
pub fn accept(stream: TcpStream) -> (Arc<Session>, tokio::net::tcp::OwnedReadHalf) {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    (Session::new(write_half), read_half)
}

pub async fn run_receive_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    pool: Arc<BufferPool>,
    mut on_frame: impl FnMut(Frame) -> Result<()>,
) -> Result<()> {
    let mut decoder = Decoder::new(pool);
    let mut buf = [0u8; 4096];
    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for frame in decoder.feed(&buf[..n])? {
            on_frame(frame)?;
        }
    }
}

/// Validates an incoming `ExternalProxyToken` against the session's expected
/// token (sec. 4.8): private tokens (all-zero physical_ip) only need the
/// 16-byte secret to match; public tokens also require matching
/// address-family and physical IP to defeat spoofing from a third host.
pub fn authenticate(
    presented: &ExternalProxyToken,
    expected_token: &[u8; 16],
    expected_family: u32,
    expected_physical_ip: &[u8; 16],
) -> bool {
    presented.matches(expected_token, expected_family, expected_physical_ip)
}

pub fn virtual_ip_from_addr(addr: SocketAddrV4) -> u32 {
    u32::from(*addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_token_ignores_physical_ip_mismatch() {
        let token = ExternalProxyToken {
            virtual_ip: 1,
            token: [7u8; 16],
            physical_ip: [0u8; 16],
            address_family: 2,
        };
        assert!(authenticate(&token, &[7u8; 16], 99, &[1u8; 16]));
    }

    #[test]
    fn public_token_requires_physical_ip_match() {
        let token = ExternalProxyToken {
            virtual_ip: 1,
            token: [7u8; 16],
            physical_ip: [9u8; 16],
            address_family: 2,
        };
        assert!(!authenticate(&token, &[7u8; 16], 2, &[1u8; 16]));
        assert!(authenticate(&token, &[7u8; 16], 2, &[9u8; 16]));
    }

    #[test]
    fn wrong_secret_always_fails_even_for_private_token() {
        let token = ExternalProxyToken {
            virtual_ip: 1,
            token: [7u8; 16],
            physical_ip: [0u8; 16],
            address_family: 2,
        };
        assert!(!authenticate(&token, &[8u8; 16], 2, &[9u8; 16]));
    }
}
