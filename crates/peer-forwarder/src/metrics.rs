// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named counters and timers emitted by the peer forwarder.
//!
//! The forwarder never talks to a metrics backend directly. Callers inject a
//! [`MetricsRecorder`] and wire it to whatever backend the node uses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub const SERVER_REQUEST_PROCESSING_LATENCY: &str = "serverRequestProcessingLatency";
pub const RECORDS_RECEIVED_FROM_PEERS: &str = "recordsReceivedFromPeers";
pub const REQUESTS_TOO_LARGE: &str = "requestsTooLarge";
pub const REQUEST_TIMEOUTS: &str = "requestTimeouts";
pub const REQUESTS_UNPROCESSABLE: &str = "requestsUnprocessable";
pub const BAD_REQUESTS: &str = "badRequests";
pub const REQUESTS_REJECTED: &str = "requestsRejected";

pub const RECORDS_TO_BE_PROCESSED_LOCALLY: &str = "recordsToBeProcessedLocally";
pub const RECORDS_ACTUALLY_PROCESSED_LOCALLY: &str = "recordsActuallyProcessedLocally";
pub const RECORDS_TO_BE_FORWARDED: &str = "recordsToBeForwarded";
pub const RECORDS_SUCCESSFULLY_FORWARDED: &str = "recordsSuccessfullyForwarded";
pub const RECORDS_FAILED_FORWARDING: &str = "recordsFailedForwarding";
pub const RECORDS_MISSING_IDENTIFICATION_KEYS: &str = "recordsMissingIdentificationKeys";
pub const RECORDS_SENT_TO_DEAD_LETTER: &str = "recordsSentToDeadLetter";
pub const RECORDS_DROPPED: &str = "recordsDropped";
pub const REQUESTS_FAILED: &str = "requestsFailed";
pub const REQUESTS_SUCCESSFUL: &str = "requestsSuccessful";

pub trait MetricsRecorder: Send + Sync {
    fn increment_counter(&self, name: &'static str, value: u64);

    fn record_latency(&self, name: &'static str, latency: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _value: u64) {}

    fn record_latency(&self, _name: &'static str, _latency: Duration) {}
}

/// Aggregate of every latency recorded under one timer name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimerStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimerStats {
    fn record(&mut self, latency: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(latency);
        self.max = self.max.max(latency);
    }

    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.count).ok().filter(|count| *count > 0)?;
        Some(self.total / count)
    }
}

/// Keeps every counter and a fixed-size aggregate per timer in memory. Used by tests and for
/// the shutdown summary.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    timers: Mutex<HashMap<&'static str, TimerStats>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        match self.counters.lock() {
            Ok(counters) => counters.get(name).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(name).copied().unwrap_or(0),
        }
    }

    pub fn timer(&self, name: &str) -> TimerStats {
        match self.timers.lock() {
            Ok(timers) => timers.get(name).copied().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().get(name).copied().unwrap_or_default(),
        }
    }

    pub fn timer_count(&self, name: &str) -> u64 {
        self.timer(name).count
    }

    /// Snapshot of every non-zero counter, sorted by name.
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        let mut snapshot: Vec<(&'static str, u64)> = match self.counters.lock() {
            Ok(counters) => counters.iter().map(|(k, v)| (*k, *v)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
        };
        snapshot.sort();
        snapshot
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, value: u64) {
        let mut counters = match self.counters.lock() {
            Ok(counters) => counters,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counters.entry(name).or_insert(0) += value;
    }

    fn record_latency(&self, name: &'static str, latency: Duration) {
        let mut timers = match self.timers.lock() {
            Ok(timers) => timers,
            Err(poisoned) => poisoned.into_inner(),
        };
        timers.entry(name).or_default().record(latency);
    }
}
