//! ryuldn_bridge/src/upnp.rs
//! UPnP/IGD port mapping (sec. 4.4), grounded on `p2p_proxy_server.hpp`'s
//! NAT-punch lease lifecycle. No teacher candidate carried a UPnP crate;
//! `igd-next` (the maintained, tokio-integrated fork of `igd`) was adopted
//! from `other_examples/` per the enrichment rule — see DESIGN.md.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use igd_next::aio::tokio::Tokio;
use igd_next::{aio::Gateway, PortMappingProtocol, SearchOptions};

use crate::error::{LdnError, Result};

pub const PRIVATE_PORT_BASE: u16 = 39990;
pub const PRIVATE_PORT_RANGE: u16 = 10;
pub const PUBLIC_PORT_BASE: u16 = 39990;
pub const PUBLIC_PORT_RANGE: u16 = 10;
pub const PORT_LEASE_LENGTH: Duration = Duration::from_secs(60);
pub const PORT_LEASE_RENEW: Duration = Duration::from_secs(50);

/// One leased external mapping, renewed on a fixed interval until dropped.
#[derive(Clone)]
pub struct PortLease {
    gateway: Arc<Gateway<Tokio>>,
    external_port: u16,
    protocol: PortMappingProtocol,
}

pub struct UpnpClient {
    gateway: Arc<Gateway<Tokio>>,
}

impl UpnpClient {
    /// Discovers the local IGD gateway. Per sec. 4.4, failure to discover a
    /// gateway disables NAT punching for this session rather than aborting
    /// it entirely — callers fall back to direct/relay-only connectivity.
    pub async fn discover() -> Result<Self> {
        let gateway = igd_next::aio::tokio::search_gateway(SearchOptions::default())
            .await
            .map_err(|e| {
                tracing::warn!("upnp: gateway discovery failed: {e}");
                LdnError::Unreachable
            })?;
        Ok(UpnpClient { gateway: Arc::new(gateway) })
    }

    /// Sweeps `PRIVATE_PORT_BASE..+PRIVATE_PORT_RANGE` against
    /// `PUBLIC_PORT_BASE..+PUBLIC_PORT_RANGE`, matching the reference's
    /// try-each-candidate-pair loop, and leases the first pair the gateway
    /// accepts.
    pub async fn lease_any(
        &self,
        local_addr: SocketAddrV4,
        protocol: PortMappingProtocol,
        description: &str,
    ) -> Result<PortLease> {
        for offset in 0..PUBLIC_PORT_RANGE {
            let external_port = PUBLIC_PORT_BASE + offset;
            let mut local = local_addr;
            local.set_port(PRIVATE_PORT_BASE + (offset % PRIVATE_PORT_RANGE));
            match self
                .gateway
                .add_port(
                    protocol,
                    external_port,
                    std::net::SocketAddr::V4(local),
                    PORT_LEASE_LENGTH.as_secs() as u32,
                    description,
                )
                .await
            {
                Ok(()) => {
                    tracing::debug!("upnp: leased external port {external_port} -> {local}");
                    return Ok(PortLease { gateway: self.gateway.clone(), external_port, protocol });
                }
                Err(e) => {
                    tracing::trace!("upnp: port {external_port} rejected: {e}");
                }
            }
        }
        Err(LdnError::ResourceExhausted("no UPnP port mapping available in sweep range"))
    }
}

impl PortLease {
    pub fn external_port(&self) -> u16 {
        self.external_port
    }

    /// Renews the lease; callers run this on a `PORT_LEASE_RENEW` interval
    /// timer so the mapping never lapses mid-session. A 404 from the gateway
    /// (the router forgot the mapping, e.g. after a reboot) is fatal to the
    /// lease per sec. 4.4 and is surfaced rather than silently retried.
    pub async fn renew(&self, local_addr: SocketAddrV4) -> Result<()> {
        self.gateway
            .add_port(
                self.protocol,
                self.external_port,
                std::net::SocketAddr::V4(local_addr),
                PORT_LEASE_LENGTH.as_secs() as u32,
                "ryuldn-bridge",
            )
            .await
            .map_err(|e| {
                tracing::warn!("upnp: lease renewal for port {} failed: {e}", self.external_port);
                LdnError::Unreachable
            })
    }

    pub async fn release(&self) {
        if let Err(e) = self.gateway.remove_port(self.protocol, self.external_port).await {
            tracing::debug!("upnp: remove_port for {} failed (likely already gone): {e}", self.external_port);
        }
    }
}
