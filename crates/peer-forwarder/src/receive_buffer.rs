// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO that forwarded batches are written into on the owning node.
//!
//! Writers are the inbound HTTP handlers and the forwarding client's local path. The
//! pipeline worker for `(pipeline_name, plugin_id)` is the only reader. A batch is
//! enqueued as a whole or not at all.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BufferError;

pub struct ReceiveBuffer<T> {
    pipeline_name: String,
    plugin_id: String,
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    space_freed: Notify,
    records_added: Notify,
    shutdown: CancellationToken,
}

impl<T> ReceiveBuffer<T> {
    pub fn new(
        pipeline_name: impl Into<String>,
        plugin_id: impl Into<String>,
        capacity: usize,
    ) -> Self {
        ReceiveBuffer {
            pipeline_name: pipeline_name.into(),
            plugin_id: plugin_id.into(),
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            space_freed: Notify::new(),
            records_added: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Pending writes are abandoned once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueues every record in `records`, in order, waiting up to `timeout` for room.
    ///
    /// Fails with [`BufferError::Overflow`] when the batch is larger than the buffer could ever
    /// hold, and with [`BufferError::Timeout`] when room was not made in time or shutdown
    /// began while waiting. On error nothing is enqueued.
    pub async fn write_all(&self, records: Vec<T>, timeout: Duration) -> Result<(), BufferError> {
        if records.is_empty() {
            return Ok(());
        }
        let requested = records.len();
        if requested > self.capacity {
            return Err(BufferError::Overflow {
                requested,
                capacity: self.capacity,
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(BufferError::Timeout(timeout));
            }

            // Register interest before checking so a read between the check and the wait
            // is not missed.
            let space_freed = self.space_freed.notified();
            tokio::pin!(space_freed);
            space_freed.as_mut().enable();

            {
                let mut queue = self.lock();
                if self.capacity - queue.len() >= requested {
                    queue.extend(records);
                    drop(queue);
                    self.records_added.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut space_freed => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(
                        "Timed out writing {requested} records to buffer for {}/{}",
                        self.pipeline_name, self.plugin_id
                    );
                    return Err(BufferError::Timeout(timeout));
                }
                _ = self.shutdown.cancelled() => {
                    return Err(BufferError::Timeout(timeout));
                }
            }
        }
    }

    /// Removes up to `max_records` from the front of the buffer without waiting.
    pub fn read(&self, max_records: usize) -> Vec<T> {
        let drained: Vec<T> = {
            let mut queue = self.lock();
            let count = max_records.min(queue.len());
            queue.drain(..count).collect()
        };
        if !drained.is_empty() {
            self.space_freed.notify_waiters();
        }
        drained
    }

    /// Waits up to `delay` for at least one record, then reads up to `max_records`.
    pub async fn read_batch(&self, max_records: usize, delay: Duration) -> Vec<T> {
        let deadline = Instant::now() + delay;
        loop {
            let records_added = self.records_added.notified();
            tokio::pin!(records_added);
            records_added.as_mut().enable();

            if !self.is_empty() {
                return self.read(max_records);
            }

            tokio::select! {
                _ = &mut records_added => {}
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
                _ = self.shutdown.cancelled() => return self.read(max_records),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

impl<T> std::fmt::Debug for ReceiveBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveBuffer")
            .field("pipeline_name", &self.pipeline_name)
            .field("plugin_id", &self.plugin_id)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
