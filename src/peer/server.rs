//! ryuldn_bridge/src/peer/server.rs
//! Peer relay server (sec. 4.8), grounded on `p2p_proxy_server.hpp`/`.cpp`:
//! accepts connections from other session members, authenticates each via
//! `ExternalProxyToken`, and fans out `ProxyData`/`ProxyConnect` frames
//! between them — including rewriting the subnet broadcast address into a
//! fan-out to every other authenticated session member.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::peer::session::{self, Session};
use crate::protocol::codec::{self, Frame};
use crate::protocol::types::{ExternalProxyToken, PacketId, ProxyConfig};
use crate::upnp::{PortLease, UpnpClient};

/// Fixed-size session pool: the reference bounds concurrent peer-relay
/// clients to a small constant rather than growing unbounded, since an LDN
/// session itself is capped at 8 nodes.
pub const MAX_SESSIONS: usize = 8;

pub struct PeerRelayServer {
    expected_token: [u8; 16],
    expected_family: u32,
    expected_physical_ip: [u8; 16],
    broadcast_ip: Ipv4Addr,
    proxy_config: ProxyConfig,
    sessions: DashMap<Ipv4Addr, Arc<Session>>,
    upnp: Option<(UpnpClient, PortLease)>,
    pool: Arc<crate::buffer_pool::BufferPool>,
}

impl PeerRelayServer {
    pub fn new(
        expected_token: [u8; 16],
        expected_family: u32,
        expected_physical_ip: [u8; 16],
        broadcast_ip: Ipv4Addr,
        proxy_config: ProxyConfig,
    ) -> Self {
        PeerRelayServer {
            expected_token,
            expected_family,
            expected_physical_ip,
            broadcast_ip,
            proxy_config,
            sessions: DashMap::new(),
            upnp: None,
            pool: Arc::new(crate::buffer_pool::BufferPool::default()),
        }
    }

    /// Accept loop: binds `listener`, and for each connection spawns a
    /// receive task that authenticates the peer before admitting it to the
    /// session registry. Bounded by `MAX_SESSIONS`; beyond that, connections
    /// are accepted then immediately dropped rather than left to queue.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            if self.sessions.len() >= MAX_SESSIONS {
                tracing::warn!("peer_relay: session pool full, dropping connection from {peer_addr}");
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    tracing::debug!("peer_relay: session ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: tokio::net::TcpStream) -> Result<()> {
        let (session, read_half) = session::accept(stream);
        let pool = self.pool.clone();
        let this = self.clone();
        let session_for_frames = session.clone();
        session::run_receive_loop(read_half, pool, move |frame| this.clone().dispatch(session_for_frames.clone(), frame)).await
    }

    fn dispatch(self: Arc<Self>, session: Arc<Session>, frame: Frame) -> Result<()> {
        match frame {
            Frame::ExternalProxyToken(token) => {
                self.authenticate(&session, &token);
            }
            Frame::ProxyData(header, payload) => {
                if session.is_authenticated() {
                    let dest = Ipv4Addr::from(header.info.dest_ip);
                    if dest == self.broadcast_ip {
                        self.broadcast(&session, &header.info, &payload);
                    } else {
                        self.forward(dest, &header.info, &payload);
                    }
                }
            }
            Frame::ProxyConnect(req) => {
                if session.is_authenticated() {
                    self.forward_connect(&req.info);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn authenticate(&self, session: &Arc<Session>, token: &ExternalProxyToken) {
        let ok = session::authenticate(token, &self.expected_token, self.expected_family, &self.expected_physical_ip);
        if !ok {
            tracing::warn!("peer_relay: authentication failed for presented virtual_ip {:08x}", token.virtual_ip);
            return;
        }
        session.authenticated.store(true, Ordering::Release);
        session.virtual_ip.store(token.virtual_ip, Ordering::Release);
        self.sessions.insert(Ipv4Addr::from(token.virtual_ip), session.clone());

        // sec. 4.8: an authenticated session is sent the router's ProxyConfig
        // so its own local router can reconfigure rather than waiting idle.
        let session = session.clone();
        let cfg = self.proxy_config;
        tokio::spawn(async move {
            let mut fixed = [0u8; ProxyConfig::WIRE_SIZE];
            cfg.encode(&mut fixed);
            let mut out = Vec::new();
            codec::encode_fixed(PacketId::ProxyConfig, &fixed, &mut out);
            if let Err(e) = session.send_raw(&out).await {
                tracing::debug!("peer_relay: ProxyConfig send failed: {e}");
            }
        });
    }

    /// Rewrites a send to `192.168.0.255`-style broadcast into a direct
    /// fan-out across every other authenticated session (sec. 4.8); the
    /// originator is excluded so it never echoes its own datagram back.
    fn broadcast(&self, from: &Arc<Session>, info: &crate::protocol::types::ProxyInfo, payload: &[u8]) {
        let origin_ip = from.virtual_ip_addr();
        for entry in self.sessions.iter() {
            if Some(*entry.key()) == origin_ip {
                continue;
            }
            let session = entry.value().clone();
            let info = *info;
            let payload = payload.to_vec();
            tokio::spawn(async move {
                if let Err(e) = session.send_proxy_data(&info, &payload).await {
                    tracing::debug!("peer_relay: broadcast forward failed: {e}");
                }
            });
        }
    }

    fn forward(&self, dest: Ipv4Addr, info: &crate::protocol::types::ProxyInfo, payload: &[u8]) {
        if let Some(session) = self.sessions.get(&dest).map(|e| e.clone()) {
            let info = *info;
            let payload = payload.to_vec();
            tokio::spawn(async move {
                if let Err(e) = session.send_proxy_data(&info, &payload).await {
                    tracing::debug!("peer_relay: forward to {dest} failed: {e}");
                }
            });
        }
    }

    fn forward_connect(&self, info: &crate::protocol::types::ProxyInfo) {
        let dest = Ipv4Addr::from(info.dest_ip);
        if let Some(session) = self.sessions.get(&dest).map(|e| e.clone()) {
            let mut fixed = [0u8; crate::protocol::types::ProxyInfo::WIRE_SIZE];
            info.encode(&mut fixed);
            let mut out = Vec::new();
            crate::protocol::codec::encode_fixed(crate::protocol::types::PacketId::ProxyConnect, &fixed, &mut out);
            tokio::spawn(async move {
                if let Err(e) = session.send_raw(&out).await {
                    tracing::debug!("peer_relay: connect forward failed: {e}");
                }
            });
        }
    }

    /// Sets up the UPnP lease for this server's listen port, sweeping the
    /// private/public port ranges per sec. 4.4; failure to obtain a mapping
    /// disables NAT punching but does not prevent LAN-local peers.
    pub async fn with_upnp(mut self, local_addr: SocketAddrV4) -> Self {
        match UpnpClient::discover().await {
            Ok(client) => match client
                .lease_any(local_addr, igd_next::PortMappingProtocol::TCP, "ryuldn-bridge")
                .await
            {
                Ok(lease) => {
                    spawn_lease_renewal(lease.clone(), local_addr);
                    self.upnp = Some((client, lease));
                }
                Err(e) => tracing::warn!("peer_relay: UPnP lease failed: {e}"),
            },
            Err(e) => tracing::warn!("peer_relay: UPnP discovery failed: {e}"),
        }
        self
    }

    pub fn external_port(&self) -> Option<u16> {
        self.upnp.as_ref().map(|(_, lease)| lease.external_port())
    }
}

/// Keeps `lease` alive on the gateway at `PORT_LEASE_RENEW` cadence (sec.
/// 4.4: "a background renewal task refreshes it at lease_renew_seconds <
/// lease_seconds"), so the mapping never lapses mid-session. Exits quietly
/// once a renewal fails, leaving the now-expired mapping for the next
/// discovery attempt rather than retrying indefinitely against a gateway
/// that rejected it.
fn spawn_lease_renewal(lease: PortLease, local_addr: SocketAddrV4) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(crate::upnp::PORT_LEASE_RENEW);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = lease.renew(local_addr).await {
                tracing::warn!("peer_relay: UPnP lease renewal stopped: {e}");
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::Decoder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn server_starts_with_empty_session_registry() {
        let server = PeerRelayServer::new([0u8; 16], 2, [0u8; 16], Ipv4Addr::new(192, 168, 0, 255), ProxyConfig::default());
        assert_eq!(server.sessions.len(), 0);
        assert!(server.external_port().is_none());
    }

    #[tokio::test]
    async fn authenticated_session_receives_proxy_config() {
        let proxy_config = ProxyConfig { proxy_ip: u32::from(Ipv4Addr::new(192, 168, 0, 1)), subnet_mask: u32::from(Ipv4Addr::new(255, 255, 255, 0)) };
        let server = Arc::new(PeerRelayServer::new([7u8; 16], 2, [0u8; 16], Ipv4Addr::new(192, 168, 0, 255), proxy_config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().run(listener));

        let mut stream = tokio::net::TcpStream::connect(local_addr).await.unwrap();
        let token = ExternalProxyToken { virtual_ip: 1, token: [7u8; 16], physical_ip: [0u8; 16], address_family: 2 };
        let mut payload = [0u8; ExternalProxyToken::WIRE_SIZE];
        token.encode(&mut payload);
        let mut out = Vec::new();
        codec::encode_fixed(PacketId::ExternalProxyToken, &payload, &mut out);
        stream.write_all(&out).await.unwrap();

        let mut decoder = Decoder::new(Arc::new(crate::buffer_pool::BufferPool::new(1)));
        let mut buf = [0u8; 256];
        let frame = loop {
            let n = stream.read(&mut buf).await.unwrap();
            let frames = decoder.feed(&buf[..n]).unwrap();
            if let Some(frame) = frames.into_iter().next() {
                break frame;
            }
        };
        match frame {
            Frame::ProxyConfig(cfg) => assert_eq!(cfg, proxy_config),
            other => panic!("expected ProxyConfig, got {other:?}"),
        }
    }
}
