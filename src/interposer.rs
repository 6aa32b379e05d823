//! ryuldn_bridge/src/interposer.rs
//! BSD-socket interposer (sec. 4.10), grounded on `bsd_mitm_service.cpp`/
//! `.hpp`: the host's IPC command dispatch calls these functions for every
//! socket syscall it intercepts, classifying each file descriptor as real or
//! virtual and diverting virtual ones into the router instead of the host's
//! real BSD service. Classification is sticky — set on `socket()`/first use,
//! cleared only on `close()` — matching the reference's flat table design.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{LdnError, Result};
use crate::router::Router;
use crate::socket::{Protocol, VirtualSocket};

const TABLE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Unused,
    Real,
    Virtual,
}

#[derive(Clone)]
struct SocketEntry {
    kind: SocketType,
    virtual_socket: Option<Arc<VirtualSocket>>,
    protocol: Option<Protocol>,
    local: Option<SocketAddrV4>,
}

impl Default for SocketEntry {
    fn default() -> Self {
        SocketEntry { kind: SocketType::Unused, virtual_socket: None, protocol: None, local: None }
    }
}

struct Table {
    entries: Mutex<Vec<SocketEntry>>,
    router: Mutex<Option<Arc<Router>>>,
}

static TABLE: OnceLock<Table> = OnceLock::new();

fn table() -> &'static Table {
    TABLE.get_or_init(|| Table {
        entries: Mutex::new(vec![SocketEntry::default(); TABLE_SIZE]),
        router: Mutex::new(None),
    })
}

/// Installed by the orchestrator (sec. 4.11) once a `ProxyConfig` arrives;
/// cleared on session teardown so a fresh `socket()` is classified real
/// until the next session begins.
pub fn install_router(router: Arc<Router>) {
    *table().router.lock().unwrap() = Some(router);
}

pub fn clear_router() {
    *table().router.lock().unwrap() = None;
}

fn router() -> Option<Arc<Router>> {
    table().router.lock().unwrap().clone()
}

/// Allocates a new entry of `kind`, returning its fd-table index. Errno-style
/// exhaustion (`EMFILE`) is signaled by returning `None`.
pub fn open_socket(protocol: Protocol) -> Option<(usize, Option<Arc<VirtualSocket>>)> {
    let mut entries = table().entries.lock().unwrap();
    let idx = entries.iter().position(|e| e.kind == SocketType::Unused)?;
    // Classification is decided by the caller (real vs. virtual) once it
    // knows the target address; `open_socket` only reserves the slot.
    entries[idx] = SocketEntry { kind: SocketType::Real, virtual_socket: None, protocol: None, local: None };
    let _ = protocol;
    Some((idx, None))
}

/// Reclassifies slot `idx` as virtual, attaching the `VirtualSocket` that
/// handles it from here on. Called from `on_bind`/`on_connect` once the
/// target address is known to fall in the virtual subnet.
pub fn classify_virtual(idx: usize, socket: Arc<VirtualSocket>) {
    let mut entries = table().entries.lock().unwrap();
    if let Some(entry) = entries.get_mut(idx) {
        entry.kind = SocketType::Virtual;
        entry.virtual_socket = Some(socket);
    }
}

fn set_endpoint(idx: usize, protocol: Protocol, local: SocketAddrV4) {
    let mut entries = table().entries.lock().unwrap();
    if let Some(entry) = entries.get_mut(idx) {
        entry.protocol = Some(protocol);
        entry.local = Some(local);
    }
}

fn endpoint(idx: usize) -> Option<(Protocol, SocketAddrV4)> {
    let entries = table().entries.lock().unwrap();
    let entry = entries.get(idx)?;
    Some((entry.protocol?, entry.local?))
}

pub fn classify(idx: usize) -> SocketType {
    table().entries.lock().unwrap().get(idx).map(|e| e.kind).unwrap_or(SocketType::Unused)
}

pub fn virtual_socket_at(idx: usize) -> Option<Arc<VirtualSocket>> {
    table().entries.lock().unwrap().get(idx).and_then(|e| e.virtual_socket.clone())
}

/// Resets slot `idx` to unused, the only point at which classification is
/// cleared (sec. 4.10's "sticky until close" invariant). If the slot was
/// virtual, notifies the router to unregister it and close it out so its
/// ephemeral port and any peers waiting on it are released.
pub async fn on_close(idx: usize) {
    let (kind, socket, addr_proto) = {
        let entries = table().entries.lock().unwrap();
        let entry = entries.get(idx).cloned().unwrap_or_default();
        (entry.kind, entry.virtual_socket, entry.local.zip(entry.protocol))
    };
    if kind == SocketType::Virtual {
        if let Some(socket) = &socket {
            socket.close().await;
        }
        if let (Some((local, protocol)), Some(r)) = (addr_proto, router()) {
            r.unregister(protocol, local);
        }
    }
    let mut entries = table().entries.lock().unwrap();
    if let Some(entry) = entries.get_mut(idx) {
        *entry = SocketEntry::default();
    }
}

/// Decides whether `addr` belongs on the virtual LAN, i.e. whether `bind`/
/// `connect` against it should be classified virtual. Returns `false`
/// (leave it real) when no router is installed, since there is no session
/// to divert into.
pub fn should_virtualize(addr: SocketAddrV4) -> bool {
    router().map(|r| r.is_virtual_ip(*addr.ip())).unwrap_or(false)
}

/// `bind()` hook (sec. 4.10): `Some(())` means the address fell in the
/// virtual subnet and the slot is now classified virtual with no host call
/// made; `None` means the caller should fall through to the real `bind()`.
pub async fn on_bind(idx: usize, local: SocketAddrV4, protocol: Protocol) -> Option<()> {
    if local.ip() == &Ipv4Addr::UNSPECIFIED || !should_virtualize(local) {
        return None;
    }
    let r = router()?;
    let socket = VirtualSocket::new(protocol);
    let bound = if local.port() == 0 { r.allocate_ephemeral(protocol, socket.clone()).ok()? } else {
        r.register(protocol, local, socket.clone());
        local
    };
    socket.bind(bound).await.ok()?;
    classify_virtual(idx, socket);
    set_endpoint(idx, protocol, bound);
    Some(())
}

/// `connect()` hook: analogous to `on_bind`, classifying virtual when the
/// destination falls in the subnet and driving the actual `ProxyConnect`
/// handshake through the router rather than just flipping a flag.
pub async fn on_connect(idx: usize, remote: SocketAddrV4, protocol: Protocol) -> Option<Result<()>> {
    if !should_virtualize(remote) {
        return None;
    }
    let r = router()?;
    let socket = match virtual_socket_at(idx) {
        Some(s) => s,
        None => {
            let s = VirtualSocket::new(protocol);
            classify_virtual(idx, s.clone());
            s
        }
    };
    let local = match endpoint(idx) {
        Some((_, local)) => local,
        None => {
            let local = r.allocate_ephemeral(protocol, socket.clone()).ok()?;
            socket.bind(local).await.ok()?;
            set_endpoint(idx, protocol, local);
            local
        }
    };
    Some(r.connect_out(&socket, local, protocol, remote).await)
}

/// `send()` hook. Per sec. 4.10, a virtual UDP fd with no destination always
/// fails `ENOTCONN`; a virtual TCP fd sends to its already-connected peer.
pub async fn on_send(idx: usize, payload: Vec<u8>) -> Option<i32> {
    let socket = virtual_socket_at(idx)?;
    if socket.protocol == Protocol::Udp {
        return Some(ENOTCONN);
    }
    on_sendto_inner(idx, &socket, payload, None).await
}

/// `sendto()` hook: routes `payload` to `dest` through the router, returning
/// the byte count on success or `-1` (with `EHOSTUNREACH`) on failure.
pub async fn on_sendto(idx: usize, payload: Vec<u8>, dest: SocketAddrV4) -> Option<i32> {
    let socket = virtual_socket_at(idx)?;
    on_sendto_inner(idx, &socket, payload, Some(dest)).await
}

async fn on_sendto_inner(idx: usize, socket: &Arc<VirtualSocket>, payload: Vec<u8>, dest: Option<SocketAddrV4>) -> Option<i32> {
    let r = router()?;
    let (protocol, local) = endpoint(idx)?;
    let len = payload.len() as i32;
    let result = match dest {
        Some(dest) => socket.send_to(dest).await,
        None => socket.send().await,
    };
    let peer = match result {
        Ok(peer) => peer,
        Err(LdnError::WriteShutdown) | Err(LdnError::NotConnected) => return Some(ENOTCONN),
        Err(_) => return Some(EHOSTUNREACH),
    };
    match r.send_data_out(local, protocol, peer, payload) {
        Ok(()) => Some(len),
        Err(_) => Some(EHOSTUNREACH),
    }
}

/// `recv()`/`recvfrom()` hook: one non-blocking dequeue. Empty queue reports
/// would-block immediately rather than waiting, matching the reference's
/// non-blocking BSD contract for this interposer layer.
pub async fn on_recvfrom(idx: usize, max_len: usize) -> Option<(i32, Option<SocketAddrV4>, Vec<u8>)> {
    let socket = virtual_socket_at(idx)?;
    match socket.try_receive_from(max_len).await {
        Some((from, data)) => {
            let n = data.len() as i32;
            Some((n, Some(from), data))
        }
        None => Some((EWOULDBLOCK, None, Vec::new())),
    }
}

pub async fn on_recv(idx: usize, max_len: usize) -> Option<i32> {
    on_recvfrom(idx, max_len).await.map(|(n, _, _)| n)
}

/// `setsockopt(SOL_SOCKET, SO_BROADCAST, ...)` hook: opts a virtual UDP
/// socket in to the router's broadcast fan-out (sec. 4.7). No-op (returns
/// `None`) on a non-virtual or unknown slot, same as the other hooks.
pub async fn on_set_broadcast(idx: usize, enabled: bool) -> Option<()> {
    let socket = virtual_socket_at(idx)?;
    socket.set_broadcast(enabled).await;
    Some(())
}

pub const EWOULDBLOCK: i32 = libc::EWOULDBLOCK;
pub const ENOTCONN: i32 = libc::ENOTCONN;
pub const EHOSTUNREACH: i32 = libc::EHOSTUNREACH;
pub const EMFILE: i32 = libc::EMFILE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::ProxyConfig;

    fn make_router() -> Arc<Router> {
        Arc::new(Router::new(ProxyConfig {
            proxy_ip: u32::from(Ipv4Addr::new(192, 168, 0, 1)),
            subnet_mask: u32::from(Ipv4Addr::new(255, 255, 255, 0)),
        }))
    }

    #[tokio::test]
    async fn fresh_slot_is_unused_until_opened() {
        on_close(100).await;
        assert_eq!(classify(100), SocketType::Unused);
    }

    #[tokio::test]
    async fn open_then_classify_virtual_round_trips() {
        let (idx, _) = open_socket(Protocol::Tcp).unwrap();
        assert_eq!(classify(idx), SocketType::Real);
        let sock = VirtualSocket::new(Protocol::Tcp);
        classify_virtual(idx, sock);
        assert_eq!(classify(idx), SocketType::Virtual);
        assert!(virtual_socket_at(idx).is_some());
        on_close(idx).await;
        assert_eq!(classify(idx), SocketType::Unused);
        assert!(virtual_socket_at(idx).is_none());
    }

    #[tokio::test]
    async fn bind_outside_virtual_subnet_forwards_to_host() {
        install_router(make_router());
        let local = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4000);
        assert!(on_bind(101, local, Protocol::Udp).await.is_none());
        clear_router();
    }

    #[tokio::test]
    async fn bind_inside_virtual_subnet_is_classified_virtual() {
        install_router(make_router());
        let local = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 50), 4001);
        assert!(on_bind(102, local, Protocol::Udp).await.is_some());
        assert_eq!(classify(102), SocketType::Virtual);
        on_close(102).await;
        clear_router();
    }

    #[tokio::test]
    async fn send_on_virtual_udp_fd_always_fails_not_connected() {
        install_router(make_router());
        let local = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 50), 4002);
        on_bind(103, local, Protocol::Udp).await.unwrap();
        assert_eq!(on_send(103, vec![1, 2, 3]).await, Some(ENOTCONN));
        on_close(103).await;
        clear_router();
    }

    #[tokio::test]
    async fn recvfrom_on_empty_queue_reports_would_block() {
        install_router(make_router());
        let local = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 50), 4003);
        on_bind(104, local, Protocol::Udp).await.unwrap();
        let (n, from, data) = on_recvfrom(104, 1500).await.unwrap();
        assert_eq!(n, EWOULDBLOCK);
        assert!(from.is_none());
        assert!(data.is_empty());
        on_close(104).await;
        clear_router();
    }
}
