//! ryuldn_bridge/src/master_client.rs
//! Master relay client (sec. 4.5), grounded on `ldn_master_proxy_client.hpp`:
//! owns the single TCP connection to the master relay, drives the LDN
//! session state machine, and answers request/reply RPCs (Scan/Connect/
//! CreateNetwork/Reject) issued from the host through a oneshot table,
//! exactly mirroring the reference's condvar-gated synchronous calls but
//! expressed as async `oneshot::Receiver::await` with a bounding timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::buffer_pool::BufferPool;
use crate::error::{LdnError, NetworkError, Result};
use crate::protocol::codec::{self, Decoder, Frame};
use crate::protocol::types::*;
use crate::router::OutboundFrame;

pub const FAILURE_TIMEOUT: Duration = Duration::from_millis(4000);
pub const SCAN_TIMEOUT: Duration = Duration::from_millis(1000);
pub const INACTIVE_TIMEOUT: Duration = Duration::from_millis(6000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Initialized,
    Scanning,
    HostCreating,
    HostActive,
    ClientConnecting,
    ClientConnected,
    Disconnecting,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub state: &'static str,
    pub network: Option<NetworkSummary>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkSummary {
    pub ssid: String,
    pub node_count: u8,
    pub node_count_max: u8,
}

enum PendingReply {
    Connect(oneshot::Sender<Result<NetworkInfo>>),
    CreateNetwork(oneshot::Sender<Result<NetworkInfo>>),
    Reject(oneshot::Sender<Result<()>>),
    Scan(mpsc::UnboundedSender<NetworkInfo>),
}

struct Shared {
    state: RwLock<SessionState>,
    last_error: RwLock<Option<String>>,
    network: RwLock<Option<NetworkInfo>>,
    proxy_config: RwLock<Option<ProxyConfig>>,
    external_proxy: RwLock<Option<ExternalProxyConfig>>,
    pending: Mutex<Vec<PendingReply>>,
    write_half: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
}

/// Handle passed to FFI/orchestrator callers. Cloning shares the same
/// connection and state; the worker task owns the socket's read half.
#[derive(Clone)]
pub struct MasterClient {
    shared: Arc<Shared>,
    pool: Arc<BufferPool>,
}

impl MasterClient {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        MasterClient {
            shared: Arc::new(Shared {
                state: RwLock::new(SessionState::None),
                last_error: RwLock::new(None),
                network: RwLock::new(None),
                proxy_config: RwLock::new(None),
                external_proxy: RwLock::new(None),
                pending: Mutex::new(Vec::new()),
                write_half: Mutex::new(None),
            }),
            pool,
        }
    }

    /// Connects to the master relay and spawns the receive-driven worker
    /// loop. Matches the reference's `Initialize`/`EnsureConnected` pair,
    /// collapsed into one async call since there is no blocking caller
    /// thread to keep responsive while dialing.
    pub async fn connect(&self, addr: SocketAddr, passphrase: &str) -> Result<()> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        *self.shared.write_half.lock().await = Some(write_half);
        *self.shared.state.write().await = SessionState::Initialized;

        self.send_passphrase(passphrase).await?;

        let shared = self.shared.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = worker_loop(shared.clone(), pool, read_half).await {
                tracing::warn!("master_client: worker loop exited: {e}");
                *shared.state.write().await = SessionState::Error;
                *shared.last_error.write().await = Some(e.to_string());
            }
        });
        Ok(())
    }

    pub async fn disconnect(&self) {
        *self.shared.write_half.lock().await = None;
        *self.shared.state.write().await = SessionState::None;
        self.fail_all_pending().await;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = *self.shared.state.read().await;
        let network = self.shared.network.read().await.as_ref().map(|n| NetworkSummary {
            ssid: n.ssid(),
            node_count: n.node_count(),
            node_count_max: n.node_count_max(),
        });
        SessionSnapshot {
            state: state_name(state),
            network,
            last_error: self.shared.last_error.read().await.clone(),
        }
    }

    pub async fn proxy_config(&self) -> Option<ProxyConfig> {
        *self.shared.proxy_config.read().await
    }

    /// Consumes the most recently received `ExternalProxy` advertisement, if
    /// any (sec. 4.5): the orchestrator uses this to stand up a direct peer
    /// relay client, upgrading away from this client as the fallback relay.
    pub async fn take_external_proxy(&self) -> Option<ExternalProxyConfig> {
        self.shared.external_proxy.write().await.take()
    }

    /// Spawns a task that serializes `OutboundFrame`s onto the master
    /// connection, and returns the sender half for `Router::set_outbound`.
    /// This is the fallback relay path (sec. 4.5): used until/unless
    /// `ExternalProxy` upgrades the router to a direct peer relay client.
    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<OutboundFrame> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = this.relay_outbound(frame).await {
                    tracing::debug!("master_client: outbound relay failed: {e}");
                }
            }
        });
        tx
    }

    async fn relay_outbound(&self, frame: OutboundFrame) -> Result<()> {
        self.write_raw(&frame.encode()).await
    }

    async fn send_passphrase(&self, passphrase: &str) -> Result<()> {
        let mut bytes = passphrase.as_bytes().to_vec();
        bytes.push(0);
        let mut out = Vec::new();
        codec::encode_fixed(PacketId::Passphrase, &bytes, &mut out);
        self.write_raw(&out).await
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.shared.write_half.lock().await;
        let w = guard.as_mut().ok_or(LdnError::NotConnected)?;
        w.write_all(bytes).await?;
        Ok(())
    }

    /// Synthesizes the sec. 9 "instantaneous state change" dummy network so
    /// the host sees `HostActive` immediately, then issues the real
    /// CreateAccessPoint request and awaits the master's authoritative
    /// `Connected`/`NetworkError` reply with a bounded timeout.
    pub async fn create_network(&self, req: CreateAccessPointRequest, advertise: Vec<u8>, ssid: &str, private: bool) -> Result<NetworkInfo> {
        *self.shared.state.write().await = SessionState::HostCreating;
        let dummy = NetworkInfo::synthetic(ssid, 1, req.node_count_max.max(1));
        *self.shared.network.write().await = Some(dummy.clone());

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.push(PendingReply::CreateNetwork(tx));

        let mut fixed = [0u8; 10];
        fixed[0..2].copy_from_slice(&req.security_mode.to_le_bytes());
        fixed[2] = req.station_accept_policy;
        fixed[4..6].copy_from_slice(&req.channel.to_le_bytes());
        fixed[6] = req.node_count_max;
        fixed[8..10].copy_from_slice(&req.local_communication_version.to_le_bytes());
        let id = if private { PacketId::CreateAccessPointPrivate } else { PacketId::CreateAccessPoint };
        let mut out = Vec::new();
        codec::encode_with_tail(id, &fixed, &advertise, &mut out);
        self.write_raw(&out).await?;

        match tokio::time::timeout(FAILURE_TIMEOUT, rx).await {
            Ok(Ok(result)) => {
                let info = result?;
                *self.shared.state.write().await = SessionState::HostActive;
                *self.shared.network.write().await = Some(info.clone());
                Ok(info)
            }
            Ok(Err(_)) => Err(LdnError::Timeout("create_network: reply channel dropped")),
            Err(_) => Err(LdnError::Timeout("create_network")),
        }
    }

    pub async fn scan(&self, filter: ScanFilter) -> Result<Vec<NetworkInfo>> {
        *self.shared.state.write().await = SessionState::Scanning;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.shared.pending.lock().await.push(PendingReply::Scan(tx));

        let mut payload = [0u8; 8];
        payload.copy_from_slice(&filter.local_communication_id.to_le_bytes());
        let mut out = Vec::new();
        codec::encode_fixed(PacketId::Scan, &payload, &mut out);
        self.write_raw(&out).await?;

        let mut results = Vec::new();
        let _ = tokio::time::timeout(SCAN_TIMEOUT, async {
            while let Some(info) = rx.recv().await {
                results.push(info);
            }
        })
        .await;
        *self.shared.state.write().await = SessionState::Initialized;
        Ok(results)
    }

    pub async fn connect_to(&self, info: NetworkInfo, security_mode: u16, local_communication_version: u16, private: bool) -> Result<NetworkInfo> {
        *self.shared.state.write().await = SessionState::ClientConnecting;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.push(PendingReply::Connect(tx));

        let mut fixed = vec![0u8; NETWORK_INFO_SIZE + 4];
        fixed[0..NETWORK_INFO_SIZE].copy_from_slice(info.encode());
        fixed[NETWORK_INFO_SIZE..NETWORK_INFO_SIZE + 2].copy_from_slice(&security_mode.to_le_bytes());
        fixed[NETWORK_INFO_SIZE + 2..NETWORK_INFO_SIZE + 4].copy_from_slice(&local_communication_version.to_le_bytes());
        let id = if private { PacketId::ConnectPrivate } else { PacketId::Connect };
        let mut out = Vec::new();
        codec::encode_fixed(id, &fixed, &mut out);
        self.write_raw(&out).await?;

        match tokio::time::timeout(FAILURE_TIMEOUT, rx).await {
            Ok(Ok(result)) => {
                let info = result?;
                *self.shared.state.write().await = SessionState::ClientConnected;
                *self.shared.network.write().await = Some(info.clone());
                Ok(info)
            }
            Ok(Err(_)) => Err(LdnError::Timeout("connect: reply channel dropped")),
            Err(_) => Err(LdnError::Timeout("connect")),
        }
    }

    pub async fn reject(&self, req: RejectRequest) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.push(PendingReply::Reject(tx));

        let mut payload = [0u8; RejectRequest::WIRE_SIZE];
        req.encode(&mut payload);
        let mut out = Vec::new();
        codec::encode_fixed(PacketId::Reject, &payload, &mut out);
        self.write_raw(&out).await?;

        match tokio::time::timeout(FAILURE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            // Idempotent per sec. 8: a second reject for the same node is a no-op OK,
            // not an error, matching the reference's reject-reply-is-fire-and-forget style.
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(LdnError::Timeout("reject")),
        }
    }

    pub async fn disconnect_network(&self, reason: u32) -> Result<()> {
        *self.shared.state.write().await = SessionState::Disconnecting;
        let msg = DisconnectMessage { node_id: 0, reason };
        let mut payload = [0u8; DisconnectMessage::WIRE_SIZE];
        msg.encode(&mut payload);
        let mut out = Vec::new();
        codec::encode_fixed(PacketId::Disconnect, &payload, &mut out);
        self.write_raw(&out).await?;
        *self.shared.network.write().await = None;
        *self.shared.state.write().await = SessionState::None;
        Ok(())
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.shared.pending.lock().await;
        for p in pending.drain(..) {
            match p {
                PendingReply::Connect(tx) | PendingReply::CreateNetwork(tx) => {
                    let _ = tx.send(Err(LdnError::NotConnected));
                }
                PendingReply::Reject(tx) => {
                    let _ = tx.send(Err(LdnError::NotConnected));
                }
                PendingReply::Scan(_) => {}
            }
        }
    }
}

fn state_name(s: SessionState) -> &'static str {
    match s {
        SessionState::None => "None",
        SessionState::Initialized => "Initialized",
        SessionState::Scanning => "Scanning",
        SessionState::HostCreating => "HostCreating",
        SessionState::HostActive => "HostActive",
        SessionState::ClientConnecting => "ClientConnecting",
        SessionState::ClientConnected => "ClientConnected",
        SessionState::Disconnecting => "Disconnecting",
        SessionState::Error => "Error",
    }
}

/// Reads from the master socket, feeds the streaming decoder, and dispatches
/// each assembled `Frame` into shared state or a pending reply — the async
/// analogue of the reference's dedicated receive thread plus callback table.
async fn worker_loop(
    shared: Arc<Shared>,
    pool: Arc<BufferPool>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
) -> Result<()> {
    let mut decoder = Decoder::new(pool);
    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(INACTIVE_TIMEOUT, read_half.read(&mut buf))
            .await
            .map_err(|_| LdnError::Timeout("master relay inactive"))??;
        if n == 0 {
            return Err(LdnError::NotConnected);
        }
        let frames = decoder.feed(&buf[..n])?;
        for frame in frames {
            handle_frame(&shared, frame).await;
        }
    }
}

async fn handle_frame(shared: &Arc<Shared>, frame: Frame) {
    match frame {
        Frame::Connected(info) => {
            // The master relay reuses `Connected` to confirm both a host's
            // CreateAccessPoint and a client's Connect; whichever is
            // outstanding resolves, never both, since a client can't be
            // simultaneously hosting and joining.
            deliver_network(shared, |p| matches!(p, PendingReply::Connect(_) | PendingReply::CreateNetwork(_)), Ok(info)).await;
        }
        Frame::SyncNetwork(info) => {
            *shared.network.write().await = Some(info);
        }
        Frame::ScanReply(info) => {
            let pending = shared.pending.lock().await;
            if let Some(PendingReply::Scan(tx)) = pending.iter().find(|p| matches!(p, PendingReply::Scan(_))) {
                let _ = tx.send(info);
            }
        }
        Frame::ScanReplyEnd => {
            shared.pending.lock().await.retain(|p| !matches!(p, PendingReply::Scan(_)));
        }
        Frame::RejectReply => {
            let mut pending = shared.pending.lock().await;
            if let Some(idx) = pending.iter().position(|p| matches!(p, PendingReply::Reject(_))) {
                if let PendingReply::Reject(tx) = pending.remove(idx) {
                    let _ = tx.send(Ok(()));
                }
            }
        }
        Frame::NetworkError(msg) => {
            let err = NetworkError::from_wire(msg.error_code);
            tracing::debug!("master_client: network error {err}");
            *shared.last_error.write().await = Some(err.to_string());
            deliver_network(
                shared,
                |p| matches!(p, PendingReply::Connect(_) | PendingReply::CreateNetwork(_)),
                Err(LdnError::Protocol(err)),
            )
            .await;
        }
        Frame::Disconnect(_) => {
            *shared.network.write().await = None;
            *shared.state.write().await = SessionState::None;
        }
        Frame::ProxyConfig(cfg) => {
            *shared.proxy_config.write().await = Some(cfg);
        }
        Frame::ExternalProxy(cfg) => {
            *shared.external_proxy.write().await = Some(cfg);
        }
        Frame::Ping(ping) => {
            tracing::trace!("master_client: ping id={}", ping.id);
        }
        _ => {}
    }
}

/// Finds the first pending `Connect`/`CreateNetwork` reply matching
/// `predicate`, removes it, and delivers `value`. Only one of the two kinds
/// is ever outstanding at a time, so "first match" is unambiguous.
async fn deliver_network(shared: &Arc<Shared>, predicate: impl Fn(&PendingReply) -> bool, value: Result<NetworkInfo>) {
    let mut pending = shared.pending.lock().await;
    if let Some(idx) = pending.iter().position(&predicate) {
        match pending.remove(idx) {
            PendingReply::Connect(tx) | PendingReply::CreateNetwork(tx) => {
                let _ = tx.send(value);
            }
            other => pending.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_stable_for_ffi_json() {
        assert_eq!(state_name(SessionState::HostActive), "HostActive");
        assert_eq!(state_name(SessionState::None), "None");
    }
}
