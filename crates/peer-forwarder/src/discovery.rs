// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{DiscoveryMode, PeerForwarderConfiguration};
use crate::hash_ring::ClusterState;

#[async_trait]
pub trait PeerListProvider: Send + Sync {
    /// Returns the current peer addresses, including this node.
    async fn peer_list(&self) -> Result<Vec<String>, std::io::Error>;
}

/// Single-node cluster: the only peer is ourselves.
pub struct LocalPeerListProvider {
    local_address: String,
}

impl LocalPeerListProvider {
    pub fn new(local_address: impl Into<String>) -> Self {
        LocalPeerListProvider {
            local_address: local_address.into(),
        }
    }
}

#[async_trait]
impl PeerListProvider for LocalPeerListProvider {
    async fn peer_list(&self) -> Result<Vec<String>, std::io::Error> {
        Ok(vec![self.local_address.clone()])
    }
}

pub struct StaticPeerListProvider {
    endpoints: Vec<String>,
}

impl StaticPeerListProvider {
    pub fn new(endpoints: Vec<String>) -> Self {
        StaticPeerListProvider { endpoints }
    }
}

#[async_trait]
impl PeerListProvider for StaticPeerListProvider {
    async fn peer_list(&self) -> Result<Vec<String>, std::io::Error> {
        Ok(self.endpoints.clone())
    }
}

/// Resolves every A/AAAA record of a domain name to a peer on `port`.
pub struct DnsPeerListProvider {
    domain_name: String,
    port: u16,
}

impl DnsPeerListProvider {
    pub fn new(domain_name: impl Into<String>, port: u16) -> Self {
        DnsPeerListProvider {
            domain_name: domain_name.into(),
            port,
        }
    }
}

#[async_trait]
impl PeerListProvider for DnsPeerListProvider {
    async fn peer_list(&self) -> Result<Vec<String>, std::io::Error> {
        let addrs = tokio::net::lookup_host((self.domain_name.as_str(), self.port)).await?;
        Ok(addrs.map(|addr| addr.to_string()).collect())
    }
}

pub fn peer_list_provider_from_config(
    config: &PeerForwarderConfiguration,
) -> Arc<dyn PeerListProvider> {
    match config.discovery_mode {
        DiscoveryMode::LocalNode => Arc::new(LocalPeerListProvider::new(config.local_address())),
        DiscoveryMode::Static => {
            Arc::new(StaticPeerListProvider::new(config.static_endpoints.clone()))
        }
        DiscoveryMode::Dns => Arc::new(DnsPeerListProvider::new(
            config.domain_name.clone().unwrap_or_default(),
            config.port(),
        )),
    }
}

/// Queries the provider once and swaps the result into `cluster`.
pub async fn refresh_peers(cluster: &ClusterState, provider: &dyn PeerListProvider) -> bool {
    match provider.peer_list().await {
        Ok(peers) => {
            let changed = cluster.update_peers(&peers);
            if changed {
                info!("Peer list changed, now {} peers", cluster.peer_count());
            }
            changed
        }
        Err(e) => {
            // Keep routing with the last known ring
            error!("Unable to refresh peer list: {e}");
            false
        }
    }
}

/// Re-queries `provider` every `interval` until `cancel` fires.
pub fn spawn_refresh(
    cluster: Arc<ClusterState>,
    provider: Arc<dyn PeerListProvider>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // discard first tick, which is instantaneous
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stopping peer list refresh");
                    return;
                }
                _ = ticker.tick() => {
                    refresh_peers(&cluster, provider.as_ref()).await;
                }
            }
        }
    })
}
