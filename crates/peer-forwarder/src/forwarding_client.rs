// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routes a pipeline's events to the peers that own them.
//!
//! Events owned by this node go straight into the local receive buffer. Events owned by a
//! peer are grouped per peer, split into requests of at most `forwarding_batch_size`, and
//! POSTed concurrently. A request that still fails after its retries falls back exactly once,
//! to local processing or to a dead letter sink depending on configuration.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::codec;
use crate::config::{ForwardingFailurePolicy, PeerForwarderConfiguration};
use crate::error::ForwardingError;
use crate::event::Event;
use crate::hash_ring::ClusterState;
use crate::http_service::PEER_FORWARDER_PATH;
use crate::metrics::{
    MetricsRecorder, RECORDS_ACTUALLY_PROCESSED_LOCALLY, RECORDS_DROPPED,
    RECORDS_FAILED_FORWARDING, RECORDS_MISSING_IDENTIFICATION_KEYS, RECORDS_SENT_TO_DEAD_LETTER,
    RECORDS_SUCCESSFULLY_FORWARDED, RECORDS_TO_BE_FORWARDED, RECORDS_TO_BE_PROCESSED_LOCALLY,
    REQUESTS_FAILED, REQUESTS_SUCCESSFUL,
};
use crate::receive_buffer::ReceiveBuffer;

/// Destination for batches that could not be delivered to their owning peer.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(
        &self,
        pipeline_name: &str,
        plugin_id: &str,
        events: Vec<Event>,
        reason: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Record counts for one call to [`ForwardingClient::forward`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingOutcome {
    pub processed_locally: usize,
    pub forwarded: usize,
    pub failed_forwarding: usize,
    pub sent_to_dead_letter: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`.
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

pub struct ForwardingClient {
    pipeline_name: String,
    plugin_id: String,
    identification_keys: Vec<String>,
    cluster: Arc<ClusterState>,
    local_buffer: Arc<ReceiveBuffer<Event>>,
    http_client: reqwest::Client,
    scheme: &'static str,
    forwarding_batch_size: usize,
    forwarding_timeout: Duration,
    local_write_timeout: Duration,
    retry: RetryPolicy,
    failure_policy: ForwardingFailurePolicy,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl ForwardingClient {
    pub fn new(
        config: &PeerForwarderConfiguration,
        cluster: Arc<ClusterState>,
        local_buffer: Arc<ReceiveBuffer<Event>>,
        identification_keys: Vec<String>,
        http_client: reqwest::Client,
        metrics: Arc<dyn MetricsRecorder>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Result<Self, ForwardingError> {
        if config.forwarding_failure_policy == ForwardingFailurePolicy::DeadLetter
            && dead_letter.is_none()
        {
            return Err(ForwardingError::MissingDeadLetterSink);
        }
        Ok(ForwardingClient {
            pipeline_name: local_buffer.pipeline_name().to_string(),
            plugin_id: local_buffer.plugin_id().to_string(),
            identification_keys,
            cluster,
            local_buffer,
            http_client,
            scheme: if config.ssl { "https" } else { "http" },
            forwarding_batch_size: config.forwarding_batch_size.max(1),
            forwarding_timeout: config.forwarding_timeout(),
            local_write_timeout: config.failed_forwarding_local_write_timeout(),
            retry: RetryPolicy {
                max_retries: config.forwarding_max_retries,
                backoff_base: Duration::from_millis(config.forwarding_retry_backoff_base_ms),
            },
            failure_policy: config.forwarding_failure_policy,
            dead_letter,
            metrics,
        })
    }

    /// The value this client routes `event` on: the identification key values joined in
    /// declaration order. `None` when the event has none of the keys.
    pub fn routing_key(&self, event: &Event) -> Option<String> {
        let values: Vec<Option<String>> = self
            .identification_keys
            .iter()
            .map(|key| event.identification_value(key))
            .collect();
        if values.iter().all(Option::is_none) {
            return None;
        }
        Some(
            values
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Splits `events` into the ones this node owns and per-peer groups for the rest.
    fn group_by_owner(&self, events: Vec<Event>) -> (Vec<Event>, BTreeMap<String, Vec<Event>>) {
        let mut local = Vec::new();
        let mut remote: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        let mut missing_keys = 0u64;

        for event in events {
            let Some(key) = self.routing_key(&event) else {
                missing_keys += 1;
                local.push(event);
                continue;
            };
            let owner = self.cluster.owner(&key);
            if self.cluster.is_local(&owner) {
                local.push(event);
            } else {
                remote.entry(owner).or_default().push(event);
            }
        }

        if missing_keys > 0 {
            self.metrics
                .increment_counter(RECORDS_MISSING_IDENTIFICATION_KEYS, missing_keys);
        }
        (local, remote)
    }

    /// Delivers every event in `events` to its owner. Never takes much longer than
    /// `forwarding_timeout` plus the local write timeout for fallbacks.
    pub async fn forward(&self, events: Vec<Event>) -> ForwardingOutcome {
        let mut outcome = ForwardingOutcome::default();
        if events.is_empty() {
            return outcome;
        }
        let deadline = Instant::now() + self.forwarding_timeout;
        let (local, remote) = self.group_by_owner(events);

        if !local.is_empty() {
            self.metrics
                .increment_counter(RECORDS_TO_BE_PROCESSED_LOCALLY, local.len() as u64);
            for batch in split_into_batches(local, self.local_buffer.capacity().max(1)) {
                self.write_locally(batch, &mut outcome).await;
            }
        }

        let mut batches: Vec<(String, Vec<Event>)> = Vec::new();
        for (peer, events) in remote {
            self.metrics
                .increment_counter(RECORDS_TO_BE_FORWARDED, events.len() as u64);
            for batch in split_into_batches(events, self.forwarding_batch_size) {
                batches.push((peer.clone(), batch));
            }
        }
        if batches.is_empty() {
            return outcome;
        }

        let delivered = self.send_batches(&batches, deadline).await;

        for ((peer, batch), delivered) in batches.into_iter().zip(delivered) {
            let count = batch.len();
            if delivered {
                self.metrics
                    .increment_counter(RECORDS_SUCCESSFULLY_FORWARDED, count as u64);
                self.metrics.increment_counter(REQUESTS_SUCCESSFUL, 1);
                outcome.forwarded += count;
            } else {
                error!("Failed to forward {count} records to {peer}, falling back");
                self.metrics
                    .increment_counter(RECORDS_FAILED_FORWARDING, count as u64);
                self.metrics.increment_counter(REQUESTS_FAILED, 1);
                outcome.failed_forwarding += count;
                self.fall_back(&peer, batch, &mut outcome).await;
            }
        }
        outcome
    }

    /// Sends every batch concurrently. Returns, per batch, whether the peer accepted it.
    async fn send_batches(
        &self,
        batches: &[(String, Vec<Event>)],
        deadline: Instant,
    ) -> Vec<bool> {
        let mut delivered = vec![false; batches.len()];
        let mut joinset = JoinSet::new();

        for (index, (peer, batch)) in batches.iter().enumerate() {
            let body = match codec::encode(batch, &self.plugin_id, &self.pipeline_name) {
                Ok(body) => body,
                Err(e) => {
                    error!("Unable to encode {} records for {peer}: {e}", batch.len());
                    continue;
                }
            };
            let url = format!("{}://{peer}{PEER_FORWARDER_PATH}", self.scheme);
            let http_client = self.http_client.clone();
            let retry = self.retry;
            joinset.spawn(async move {
                let accepted = send_with_retry(http_client, url, body, retry).await;
                (index, accepted)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, joinset.join_next()).await {
                Ok(Some(Ok((index, accepted)))) => delivered[index] = accepted,
                Ok(Some(Err(e))) => error!("Forwarding task failed: {e}"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Forwarding did not complete within {:?}, abandoning {} requests",
                        self.forwarding_timeout,
                        joinset.len()
                    );
                    joinset.abort_all();
                    break;
                }
            }
        }
        delivered
    }

    async fn write_locally(&self, batch: Vec<Event>, outcome: &mut ForwardingOutcome) {
        let count = batch.len();
        match self
            .local_buffer
            .write_all(batch, self.local_write_timeout)
            .await
        {
            Ok(()) => {
                self.metrics
                    .increment_counter(RECORDS_ACTUALLY_PROCESSED_LOCALLY, count as u64);
                outcome.processed_locally += count;
            }
            Err(e) => {
                error!(
                    "Unable to write records to local peer forwarder receive buffer due to {e}. Dropping {count} records."
                );
                self.metrics.increment_counter(RECORDS_DROPPED, count as u64);
                outcome.dropped += count;
            }
        }
    }

    async fn fall_back(&self, peer: &str, batch: Vec<Event>, outcome: &mut ForwardingOutcome) {
        match (self.failure_policy, &self.dead_letter) {
            (ForwardingFailurePolicy::DeadLetter, Some(sink)) => {
                let count = batch.len();
                let reason = format!("Unable to forward records to peer {peer}");
                match sink
                    .send(&self.pipeline_name, &self.plugin_id, batch, &reason)
                    .await
                {
                    Ok(()) => {
                        self.metrics
                            .increment_counter(RECORDS_SENT_TO_DEAD_LETTER, count as u64);
                        outcome.sent_to_dead_letter += count;
                    }
                    Err(e) => {
                        error!("Unable to send {count} records to dead letter sink: {e}");
                        self.metrics.increment_counter(RECORDS_DROPPED, count as u64);
                        outcome.dropped += count;
                    }
                }
            }
            _ => self.write_locally(batch, outcome).await,
        }
    }
}

/// POSTs `body` to `url`, retrying failures with exponential backoff. Returns whether the
/// peer accepted the batch with a 2xx status.
async fn send_with_retry(
    http_client: reqwest::Client,
    url: String,
    body: Bytes,
    retry: RetryPolicy,
) -> bool {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match http_client.post(&url).body(body.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Forwarded request to {url} on attempt {attempt}");
                return true;
            }
            Ok(response) => {
                error!(
                    "Peer {url} rejected forwarded records with status {} on attempt {attempt}",
                    response.status()
                );
            }
            Err(e) => {
                error!("Unable to send forwarded records to {url} on attempt {attempt}: {e}");
            }
        }
        if attempt > retry.max_retries {
            return false;
        }
        tokio::time::sleep(retry.backoff(attempt)).await;
    }
}

fn split_into_batches(mut events: Vec<Event>, batch_size: usize) -> Vec<Vec<Event>> {
    let mut batches = Vec::with_capacity(events.len().div_ceil(batch_size));
    while events.len() > batch_size {
        let rest = events.split_off(batch_size);
        batches.push(events);
        events = rest;
    }
    if !events.is_empty() {
        batches.push(events);
    }
    batches
}
