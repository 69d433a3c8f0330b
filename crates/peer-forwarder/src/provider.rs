// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of receive buffers, one per `(pipeline_name, plugin_id)` that needs peer forwarding.
//!
//! The registry is assembled once while pipelines start and is read-only afterwards, so
//! lookups take no locks.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PeerForwarderConfiguration;
use crate::event::Event;
use crate::hash_ring::ClusterState;
use crate::receive_buffer::ReceiveBuffer;

#[derive(Debug)]
struct Registration {
    buffer: Arc<ReceiveBuffer<Event>>,
    identification_keys: Vec<String>,
}

pub struct PeerForwarderRegistryBuilder {
    config: Arc<PeerForwarderConfiguration>,
    cluster: Arc<ClusterState>,
    shutdown: CancellationToken,
    registry: HashMap<(String, String), Registration>,
}

impl PeerForwarderRegistryBuilder {
    pub fn new(config: Arc<PeerForwarderConfiguration>, cluster: Arc<ClusterState>) -> Self {
        PeerForwarderRegistryBuilder {
            config,
            cluster,
            shutdown: CancellationToken::new(),
            registry: HashMap::new(),
        }
    }

    /// Writes still waiting on any registered buffer are abandoned when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Registers a processor that routes on `identification_keys` and returns the buffer its
    /// pipeline worker should read from. Registering the same pair twice returns the same buffer.
    pub fn register(
        &mut self,
        pipeline_name: &str,
        plugin_id: &str,
        identification_keys: Vec<String>,
    ) -> Arc<ReceiveBuffer<Event>> {
        let key = (pipeline_name.to_string(), plugin_id.to_string());
        if let Some(existing) = self.registry.get(&key) {
            return Arc::clone(&existing.buffer);
        }

        debug!(
            "Registering peer forwarder receive buffer for {pipeline_name}/{plugin_id} keyed on {:?}",
            identification_keys
        );
        let buffer = Arc::new(
            ReceiveBuffer::new(pipeline_name, plugin_id, self.config.buffer_size)
                .with_shutdown(self.shutdown.child_token()),
        );
        self.registry.insert(
            key,
            Registration {
                buffer: Arc::clone(&buffer),
                identification_keys,
            },
        );
        buffer
    }

    pub fn build(self) -> PeerForwarderProvider {
        PeerForwarderProvider {
            config: self.config,
            cluster: self.cluster,
            registry: self.registry,
        }
    }
}

#[derive(Debug)]
pub struct PeerForwarderProvider {
    config: Arc<PeerForwarderConfiguration>,
    cluster: Arc<ClusterState>,
    registry: HashMap<(String, String), Registration>,
}

impl PeerForwarderProvider {
    pub fn builder(
        config: Arc<PeerForwarderConfiguration>,
        cluster: Arc<ClusterState>,
    ) -> PeerForwarderRegistryBuilder {
        PeerForwarderRegistryBuilder::new(config, cluster)
    }

    /// True when some processor routes on an identification key and there is more than one
    /// peer to route to.
    pub fn is_peer_forwarding_required(&self) -> bool {
        self.has_identification_keys() && self.cluster.peer_count() > 1
    }

    fn has_identification_keys(&self) -> bool {
        self.registry
            .values()
            .any(|registration| !registration.identification_keys.is_empty())
    }

    pub fn get_receive_buffer(
        &self,
        pipeline_name: &str,
        plugin_id: &str,
    ) -> Option<Arc<ReceiveBuffer<Event>>> {
        self.registry
            .get(&(pipeline_name.to_string(), plugin_id.to_string()))
            .map(|registration| Arc::clone(&registration.buffer))
    }

    pub fn identification_keys(&self, pipeline_name: &str, plugin_id: &str) -> Option<&[String]> {
        self.registry
            .get(&(pipeline_name.to_string(), plugin_id.to_string()))
            .map(|registration| registration.identification_keys.as_slice())
    }

    /// Every registered buffer, sorted by pipeline then plugin.
    pub fn receive_buffers(&self) -> Vec<Arc<ReceiveBuffer<Event>>> {
        let mut keys: Vec<&(String, String)> = self.registry.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| self.registry.get(key))
            .map(|registration| Arc::clone(&registration.buffer))
            .collect()
    }

    pub fn config(&self) -> &Arc<PeerForwarderConfiguration> {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }
}
