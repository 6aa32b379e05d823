//! ryuldn_bridge/src/peer/client.rs
//! Peer relay client (sec. 4.9), grounded on `p2p_proxy_server.hpp`'s client
//! half: dials the session host's advertised peer-relay endpoint, performs
//! the `ExternalProxyToken` handshake, and keeps a receive task running so
//! inbound `ProxyData`/`ProxyConnect` frames reach the local router.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use tokio::sync::{mpsc, oneshot};

use crate::buffer_pool::BufferPool;
use crate::error::{LdnError, Result};
use crate::master_client::FAILURE_TIMEOUT;
use crate::protocol::codec::{self, Decoder, Frame};
use crate::protocol::types::{ExternalProxyToken, PacketId};
use crate::router::{OutboundFrame, Router};
use crate::socket::Protocol;

pub struct PeerRelayClient {
    write_half: tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

impl PeerRelayClient {
    /// Connects to the advertised peer-relay endpoint, performs the token
    /// handshake, and spawns a background task that feeds every inbound
    /// frame into `router`. The host signals a successful handshake by
    /// sending back a `ProxyConfig` frame (sec. 4.8) rather than an explicit
    /// accept/reject, so this waits for that frame (bounded by
    /// `FAILURE_TIMEOUT`) instead of sleeping a fixed settle time.
    pub async fn connect(addr: SocketAddr, token: ExternalProxyToken, pool: Arc<BufferPool>, router: Arc<Router>) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let (read_half, mut write_half) = stream.into_split();

        let mut payload = [0u8; ExternalProxyToken::WIRE_SIZE];
        token.encode(&mut payload);
        let mut out = Vec::new();
        codec::encode_fixed(PacketId::ExternalProxyToken, &payload, &mut out);
        write_half.write_all(&out).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(receive_loop(read_half, pool, router, Some(ready_tx)));
        tokio::time::timeout(FAILURE_TIMEOUT, ready_rx)
            .await
            .map_err(|_| LdnError::Timeout("peer_relay handshake"))?
            .map_err(|_| LdnError::Unreachable)?;

        Ok(Arc::new(PeerRelayClient { write_half: tokio::sync::Mutex::new(write_half) }))
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut w = self.write_half.lock().await;
        w.write_all(bytes).await?;
        Ok(())
    }

    /// Spawns a task serializing `OutboundFrame`s onto this peer connection,
    /// for `Router::set_outbound` to install once this client replaces the
    /// master relay as the session's direct data path (sec. 4.9).
    pub fn outbound_sender(self: &Arc<Self>) -> mpsc::UnboundedSender<OutboundFrame> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = this.relay_outbound(frame).await {
                    tracing::debug!("peer_client: outbound relay failed: {e}");
                }
            }
        });
        tx
    }

    async fn relay_outbound(&self, frame: OutboundFrame) -> Result<()> {
        self.send_raw(&frame.encode()).await
    }
}

async fn receive_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    pool: Arc<BufferPool>,
    router: Arc<Router>,
    mut ready: Option<oneshot::Sender<()>>,
) {
    use tokio::io::AsyncReadExt;
    let mut decoder = Decoder::new(pool);
    let mut buf = [0u8; 4096];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!("peer_client: framing error, dropping connection: {e}");
                return;
            }
        };
        for frame in frames {
            dispatch(&router, frame, &mut ready).await;
        }
    }
}

async fn dispatch(router: &Arc<Router>, frame: Frame, ready: &mut Option<oneshot::Sender<()>>) {
    match frame {
        Frame::ProxyConfig(cfg) => {
            router.reconfigure(cfg);
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
        }
        Frame::ProxyData(header, payload) => {
            let dest = SocketAddrV4::new(Ipv4Addr::from(header.info.dest_ip), header.info.dest_port);
            let source = SocketAddrV4::new(Ipv4Addr::from(header.info.source_ip), header.info.source_port);
            let protocol = if header.info.protocol == libc::IPPROTO_UDP as u32 { Protocol::Udp } else { Protocol::Tcp };
            if let Err(e) = router.on_proxy_data(protocol, dest, source, payload).await {
                tracing::debug!("peer_client: undeliverable proxy data: {e}");
            }
        }
        Frame::ProxyConnect(req) => {
            let dest = SocketAddrV4::new(Ipv4Addr::from(req.info.dest_ip), req.info.dest_port);
            let source = SocketAddrV4::new(Ipv4Addr::from(req.info.source_ip), req.info.source_port);
            if let Err(e) = router.on_proxy_connect(dest, source).await {
                tracing::debug!("peer_client: undeliverable proxy connect: {e}");
            }
        }
        Frame::ProxyConnectReply(resp) => {
            let local = SocketAddrV4::new(Ipv4Addr::from(resp.info.source_ip), resp.info.source_port);
            if let Err(e) = router.on_proxy_connect_reply(local).await {
                tracing::debug!("peer_client: undeliverable proxy connect reply: {e}");
            }
        }
        Frame::ProxyDisconnect(msg) => {
            let local = SocketAddrV4::new(Ipv4Addr::from(msg.info.source_ip), msg.info.source_port);
            if let Err(e) = router.on_proxy_disconnect(local).await {
                tracing::debug!("peer_client: undeliverable proxy disconnect: {e}");
            }
        }
        _ => {}
    }
}
