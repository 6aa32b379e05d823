//! ryuldn_bridge/src/orchestrator.rs
//! State orchestrator (sec. 4.11): wires the master client's `ProxyConfig`
//! callback to router construction, installs the router into the
//! interposer, and tears both down on disconnect. This is the glue the
//! reference splits across several singletons' constructors/destructors;
//! here it is one explicit owner so the session lifecycle has a single place
//! that can be read end to end.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::buffer_pool::BufferPool;
use crate::error::Result;
use crate::interposer;
use crate::master_client::{MasterClient, SessionSnapshot};
use crate::peer::client::PeerRelayClient;
use crate::protocol::types::ExternalProxyToken;
use crate::router::Router;

pub struct Orchestrator {
    pub master: MasterClient,
    router: RwLock<Option<Arc<Router>>>,
    peer_client: RwLock<Option<Arc<PeerRelayClient>>>,
    pool: Arc<BufferPool>,
}

impl Orchestrator {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Orchestrator { master: MasterClient::new(pool.clone()), router: RwLock::new(None), peer_client: RwLock::new(None), pool }
    }

    /// Polls the master client for a freshly-received `ProxyConfig` and, the
    /// first time one appears for this session, builds and installs the
    /// router with the master client wired as its (fallback) outbound relay.
    /// Cheap to call repeatedly; a no-op once the router exists.
    pub async fn ensure_router(&self) -> Option<Arc<Router>> {
        if let Some(router) = self.router.read().await.clone() {
            return Some(router);
        }
        let config = self.master.proxy_config().await?;
        let router = Arc::new(Router::new(config));
        router.set_outbound(self.master.outbound_sender());
        interposer::install_router(router.clone());
        *self.router.write().await = Some(router.clone());
        tracing::info!("orchestrator: router installed for proxy_ip={:08x}", config.proxy_ip);
        Some(router)
    }

    pub async fn router(&self) -> Option<Arc<Router>> {
        self.router.read().await.clone()
    }

    /// Drives the session's construction forward one step: builds the router
    /// once `ProxyConfig` has arrived, then upgrades to a direct peer relay
    /// once `ExternalProxy` arrives. Called from the FFI polling entry points
    /// (`ryuldn_get_session_snapshot`/`ryuldn_is_router_ready`) so session
    /// setup piggybacks on the host's existing poll cadence rather than
    /// needing a dedicated background task.
    pub async fn poll(&self) {
        if self.ensure_router().await.is_some() {
            if let Err(e) = self.ensure_peer_relay().await {
                tracing::debug!("orchestrator: peer relay upgrade did not complete: {e}");
            }
        }
    }

    /// Upgrades the session from the master-relay fallback path to a direct
    /// peer relay client once `ExternalProxy` arrives (sec. 4.5/4.9): dials
    /// the advertised peer, authenticates, and re-points the router's
    /// outbound traffic at it. Per sec. 4.5, any failure here disconnects the
    /// network rather than silently staying on the fallback path.
    pub async fn ensure_peer_relay(&self) -> Result<()> {
        let Some(router) = self.router().await else { return Ok(()) };
        let Some(cfg) = self.master.take_external_proxy().await else { return Ok(()) };

        let proxy_ip = Ipv4Addr::new(cfg.proxy_ip[0], cfg.proxy_ip[1], cfg.proxy_ip[2], cfg.proxy_ip[3]);
        let addr = SocketAddr::V4(SocketAddrV4::new(proxy_ip, cfg.proxy_port));
        let token = ExternalProxyToken {
            virtual_ip: u32::from(router.local_ip()),
            token: cfg.token,
            physical_ip: [0u8; 16],
            address_family: cfg.address_family,
        };

        match PeerRelayClient::connect(addr, token, self.pool.clone(), router.clone()).await {
            Ok(client) => {
                router.set_outbound(client.outbound_sender());
                *self.peer_client.write().await = Some(client);
                tracing::info!("orchestrator: peer relay established at {addr}");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("orchestrator: peer relay connect failed, disconnecting: {e}");
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Tears down the router and disconnects the master client, the mirror
    /// image of `ensure_router`. Safe to call even if no router was ever
    /// installed.
    pub async fn teardown(&self) {
        interposer::clear_router();
        *self.router.write().await = None;
        *self.peer_client.write().await = None;
        self.master.disconnect().await;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.master.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_router_is_none_before_proxy_config_arrives() {
        let orchestrator = Orchestrator::new(Arc::new(BufferPool::new(1)));
        assert!(orchestrator.ensure_router().await.is_none());
    }

    #[tokio::test]
    async fn teardown_without_router_does_not_panic() {
        let orchestrator = Orchestrator::new(Arc::new(BufferPool::new(1)));
        orchestrator.teardown().await;
        assert!(orchestrator.router().await.is_none());
    }
}
