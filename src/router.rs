//! ryuldn_bridge/src/router.rs
//! LDN proxy router (sec. 4.7), grounded on `ldn_proxy.hpp`/`.cpp`: the
//! switchboard between virtual sockets and the wire. Classifies addresses as
//! virtual-LAN vs. real, owns one ephemeral port pool per transport, and
//! dispatches ProxyConnect/ProxyConnectReply/ProxyData/ProxyDisconnect
//! frames to the socket they belong to.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{LdnError, Result};
use crate::ports::EphemeralPortPool;
use crate::protocol::types::{ProxyConfig, ProxyInfo};
use crate::socket::{Protocol, VirtualSocket};

/// Outbound control/data frames a virtual socket hands to the router, which
/// forwards them over whichever relay is currently wired in (sec. 4.6's
/// "emits a ProxyData frame ... via the relay"): the master relay as
/// fallback, or a peer relay client once `ExternalProxy` establishes one.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Connect(ProxyInfo),
    ConnectReply(ProxyInfo, bool),
    Data(ProxyInfo, Vec<u8>),
    Disconnect(ProxyInfo),
}

impl OutboundFrame {
    /// Encodes this frame to wire bytes, shared by every relay
    /// (`master_client`'s fallback path and `peer::client`'s direct path)
    /// that drains an outbound queue onto a `TcpStream`.
    pub fn encode(&self) -> Vec<u8> {
        use crate::protocol::codec;
        use crate::protocol::types::PacketId;
        let mut out = Vec::new();
        match self {
            OutboundFrame::Connect(info) => {
                let mut fixed = [0u8; ProxyInfo::WIRE_SIZE];
                info.encode(&mut fixed);
                codec::encode_fixed(PacketId::ProxyConnect, &fixed, &mut out);
            }
            OutboundFrame::ConnectReply(info, accepted) => {
                let mut info = *info;
                if !accepted {
                    info.source_ip = 0;
                }
                let mut fixed = [0u8; ProxyInfo::WIRE_SIZE];
                info.encode(&mut fixed);
                codec::encode_fixed(PacketId::ProxyConnectReply, &fixed, &mut out);
            }
            OutboundFrame::Data(info, payload) => {
                codec::encode_proxy_data(info, payload, &mut out);
            }
            OutboundFrame::Disconnect(info) => {
                let mut fixed = [0u8; ProxyInfo::WIRE_SIZE];
                info.encode(&mut fixed);
                codec::encode_fixed(PacketId::ProxyDisconnect, &fixed, &mut out);
            }
        }
        out
    }
}

fn protocol_wire(protocol: Protocol) -> u32 {
    match protocol {
        Protocol::Tcp => libc::IPPROTO_TCP as u32,
        Protocol::Udp => libc::IPPROTO_UDP as u32,
    }
}

fn proxy_info(local: SocketAddrV4, protocol: Protocol, remote: SocketAddrV4) -> ProxyInfo {
    ProxyInfo {
        source_ip: u32::from(*local.ip()),
        source_port: local.port(),
        dest_ip: u32::from(*remote.ip()),
        dest_port: remote.port(),
        protocol: protocol_wire(protocol),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub protocol: Protocol,
    pub local: SocketAddrV4,
}

/// The router itself. Lives for the duration of one LDN session; constructed
/// once the master relay delivers `ProxyConfig` (sec. 4.11) and torn down on
/// disconnect.
pub struct Router {
    config: StdMutex<ProxyConfig>,
    sockets: DashMap<SocketKey, Arc<VirtualSocket>>,
    // Multiple UDP sockets can share a destination port during broadcast
    // (sec. 4.7); registration order is the documented tie-break for which
    // one is addressed by a unicast send to that port.
    udp_by_port: DashMap<u16, Vec<SocketAddrV4>>,
    tcp_ports: EphemeralPortPool,
    udp_ports: EphemeralPortPool,
    outbound: StdMutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
}

impl Router {
    pub fn new(config: ProxyConfig) -> Self {
        Router {
            config: StdMutex::new(config),
            sockets: DashMap::new(),
            udp_by_port: DashMap::new(),
            tcp_ports: EphemeralPortPool::new(),
            udp_ports: EphemeralPortPool::new(),
            outbound: StdMutex::new(None),
        }
    }

    /// Installs (or replaces) the relay this router's outbound traffic is
    /// sent over. Replaced when `ExternalProxy` upgrades the session from the
    /// master-relay fallback path to a direct peer relay client.
    pub fn set_outbound(&self, tx: mpsc::UnboundedSender<OutboundFrame>) {
        *self.outbound.lock().unwrap() = Some(tx);
    }

    fn send_outbound(&self, frame: OutboundFrame) -> Result<()> {
        let guard = self.outbound.lock().unwrap();
        let tx = guard.as_ref().ok_or(LdnError::NotConnected)?;
        tx.send(frame).map_err(|_| LdnError::NotConnected)
    }

    /// Outbound half of `VirtualSocket::connect` (sec. 4.6): emits the
    /// `ProxyConnect` request, then waits for the socket's connect event to
    /// resolve via the matching `ProxyConnectReply` the wire layer delivers
    /// back through `on_proxy_connect_reply`.
    pub async fn connect_out(&self, socket: &Arc<VirtualSocket>, local: SocketAddrV4, protocol: Protocol, remote: SocketAddrV4) -> Result<()> {
        self.send_outbound(OutboundFrame::Connect(proxy_info(local, protocol, remote)))?;
        socket.connect(remote).await
    }

    pub fn send_connect_reply_out(&self, local: SocketAddrV4, protocol: Protocol, remote: SocketAddrV4, accepted: bool) -> Result<()> {
        self.send_outbound(OutboundFrame::ConnectReply(proxy_info(local, protocol, remote), accepted))
    }

    pub fn send_data_out(&self, local: SocketAddrV4, protocol: Protocol, remote: SocketAddrV4, payload: Vec<u8>) -> Result<()> {
        self.send_outbound(OutboundFrame::Data(proxy_info(local, protocol, remote), payload))
    }

    pub fn send_disconnect_out(&self, local: SocketAddrV4, protocol: Protocol, remote: SocketAddrV4) -> Result<()> {
        self.send_outbound(OutboundFrame::Disconnect(proxy_info(local, protocol, remote)))
    }

    pub fn config(&self) -> ProxyConfig {
        *self.config.lock().unwrap()
    }

    /// Applies a freshly-received `ProxyConfig` (sec. 4.8/4.9: a peer relay
    /// session is sent one on authentication so its router doesn't have to
    /// wait for the master's own copy before it knows the virtual subnet).
    pub fn reconfigure(&self, config: ProxyConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn is_virtual_ip(&self, ip: Ipv4Addr) -> bool {
        let ip_bits = u32::from(ip);
        let config = self.config();
        (ip_bits & config.subnet_mask) == (config.proxy_ip & config.subnet_mask)
    }

    pub fn is_broadcast(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) == self.config().broadcast()
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.config().proxy_ip)
    }

    /// Allocates a free ephemeral port and registers `socket` under it. This
    /// is the router-level analogue of `bind(0)`.
    pub fn allocate_ephemeral(&self, protocol: Protocol, socket: Arc<VirtualSocket>) -> Result<SocketAddrV4> {
        let pool = match protocol {
            Protocol::Tcp => &self.tcp_ports,
            Protocol::Udp => &self.udp_ports,
        };
        let port = pool.allocate().ok_or(LdnError::ResourceExhausted("ephemeral port pool exhausted"))?;
        let local = SocketAddrV4::new(self.local_ip(), port);
        self.register(protocol, local, socket);
        Ok(local)
    }

    pub fn register(&self, protocol: Protocol, local: SocketAddrV4, socket: Arc<VirtualSocket>) {
        if protocol == Protocol::Udp {
            self.udp_by_port.entry(local.port()).or_default().push(local);
        }
        self.sockets.insert(SocketKey { protocol, local }, socket);
    }

    pub fn unregister(&self, protocol: Protocol, local: SocketAddrV4) {
        self.sockets.remove(&SocketKey { protocol, local });
        if protocol == Protocol::Udp {
            if let Some(mut entries) = self.udp_by_port.get_mut(&local.port()) {
                entries.retain(|addr| *addr != local);
            }
        }
        match protocol {
            Protocol::Tcp => self.tcp_ports.release(local.port()),
            Protocol::Udp => self.udp_ports.release(local.port()),
        }
    }

    pub fn find(&self, protocol: Protocol, local: SocketAddrV4) -> Option<Arc<VirtualSocket>> {
        self.sockets.get(&SocketKey { protocol, local }).map(|e| e.clone())
    }

    /// Resolves which registered socket should receive a unicast datagram
    /// addressed to `dest` when several UDP sockets share the same port
    /// (only possible after a broadcast listen); first-registered wins.
    pub fn resolve_udp(&self, dest: SocketAddrV4) -> Option<Arc<VirtualSocket>> {
        if let Some(sock) = self.find(Protocol::Udp, dest) {
            return Some(sock);
        }
        let candidates = self.udp_by_port.get(&dest.port())?;
        let first = candidates.first().copied()?;
        self.find(Protocol::Udp, first)
    }

    /// Entry point for an inbound ProxyConnect (sec. 4.7): finds the
    /// listening socket at `dest` and offers the incoming connection.
    pub async fn on_proxy_connect(&self, dest: SocketAddrV4, source: SocketAddrV4) -> Result<()> {
        let sock = self.find(Protocol::Tcp, dest).ok_or(LdnError::NotConnected)?;
        sock.offer_incoming(source).await;
        Ok(())
    }

    pub async fn on_proxy_connect_reply(&self, local: SocketAddrV4) -> Result<()> {
        let sock = self.find(Protocol::Tcp, local).ok_or(LdnError::NotConnected)?;
        sock.mark_connected().await;
        Ok(())
    }

    /// Delivers an inbound ProxyData frame to the socket(s) it addresses
    /// (sec. 4.7). A broadcast-addressed UDP datagram fans out to every
    /// socket registered on the matching port rather than picking one, since
    /// which of them actually enqueues it is `VirtualSocket::push_data`'s
    /// call (gated on each socket's own broadcast option).
    pub async fn on_proxy_data(&self, protocol: Protocol, dest: SocketAddrV4, source: SocketAddrV4, data: Vec<u8>) -> Result<()> {
        if protocol == Protocol::Udp && self.is_broadcast(*dest.ip()) {
            let targets: Vec<Arc<VirtualSocket>> = self
                .udp_by_port
                .get(&dest.port())
                .map(|entries| entries.iter().filter_map(|addr| self.find(Protocol::Udp, *addr)).collect())
                .unwrap_or_default();
            if targets.is_empty() {
                return Err(LdnError::NotConnected);
            }
            for sock in targets {
                sock.push_data(source, dest, data.clone()).await;
            }
            return Ok(());
        }
        let sock = match protocol {
            Protocol::Tcp => self.find(Protocol::Tcp, dest),
            Protocol::Udp => self.resolve_udp(dest),
        }
        .ok_or(LdnError::NotConnected)?;
        sock.push_data(source, dest, data).await;
        Ok(())
    }

    pub async fn on_proxy_disconnect(&self, local: SocketAddrV4) -> Result<()> {
        let sock = self.find(Protocol::Tcp, local).ok_or(LdnError::NotConnected)?;
        sock.shutdown(true, true).await;
        Ok(())
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_router() -> Router {
        Router::new(ProxyConfig { proxy_ip: u32::from(Ipv4Addr::new(192, 168, 0, 1)), subnet_mask: u32::from(Ipv4Addr::new(255, 255, 255, 0)) })
    }

    #[test]
    fn virtual_ip_classification_matches_subnet() {
        let router = make_router();
        assert!(router.is_virtual_ip(Ipv4Addr::new(192, 168, 0, 42)));
        assert!(!router.is_virtual_ip(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn broadcast_address_is_subnet_or_of_host_bits() {
        let router = make_router();
        assert!(router.is_broadcast(Ipv4Addr::new(192, 168, 0, 255)));
        assert!(!router.is_broadcast(Ipv4Addr::new(192, 168, 0, 254)));
    }

    #[test]
    fn ephemeral_allocation_releases_back_to_pool() {
        let router = make_router();
        let sock = VirtualSocket::new(Protocol::Tcp);
        let addr = router.allocate_ephemeral(Protocol::Tcp, sock).unwrap();
        assert_eq!(router.socket_count(), 1);
        router.unregister(Protocol::Tcp, addr);
        assert_eq!(router.socket_count(), 0);
    }

    #[test]
    fn udp_port_sharing_resolves_to_first_registered() {
        let router = make_router();
        let first = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 40000);
        let second = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 40000);
        router.register(Protocol::Udp, first, VirtualSocket::new(Protocol::Udp));
        // second registration at the same key overwrites in `sockets`, but
        // `resolve_udp` falls back to direct match first so this mostly
        // exercises that the direct-match path is preferred over the
        // first-registered fallback.
        let resolved = router.resolve_udp(second);
        assert!(resolved.is_some());
    }

    #[tokio::test]
    async fn broadcast_data_reaches_only_opted_in_sockets() {
        let router = make_router();
        let port = 41000;
        let quiet = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 10), port);
        let listener = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 11), port);
        let quiet_sock = VirtualSocket::new(Protocol::Udp);
        quiet_sock.bind(quiet).await.unwrap();
        let listener_sock = VirtualSocket::new(Protocol::Udp);
        listener_sock.bind(listener).await.unwrap();
        listener_sock.set_broadcast(true).await;
        router.register(Protocol::Udp, quiet, quiet_sock.clone());
        router.register(Protocol::Udp, listener, listener_sock.clone());

        let broadcast_dest = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 255), port);
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 12), 5000);
        router.on_proxy_data(Protocol::Udp, broadcast_dest, source, vec![9]).await.unwrap();

        assert!(quiet_sock.try_receive_from(1500).await.is_none());
        assert!(listener_sock.try_receive_from(1500).await.is_some());
    }
}
