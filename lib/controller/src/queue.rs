// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation work queue.
//!
//! Event sources (AppWrapper watch, pod watch, dispatch triggers, periodic
//! retries) enqueue [`ReconcileKey`]s; a single [`Worker`] drains them
//! serially, which is what gives the state machine its per-object ordering
//! guarantee. The queue deduplicates by key, so dispatch triggers coalesce
//! for free: one pending `*/*` is enough, further triggers are dropped.
//!
//! Failed reconciliations are retried with exponential backoff, reset on
//! the first success.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::{AppWrapper, NAMESPACE_LABEL, NAME_LABEL};
use crate::config::DispatcherConfig;
use crate::reconciler::{Outcome, Reconciler};

/// Sentinel namespace/name meaning "run the dispatch selector".
const SENTINEL: &str = "*";

/// Key of one reconciliation request.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// The `*/*` request that runs the dispatch selector instead of a
    /// per-object reconciliation.
    pub fn dispatch_next() -> Self {
        Self::new(SENTINEL, SENTINEL)
    }

    pub fn is_dispatch_next(&self) -> bool {
        self.name == SENTINEL
    }

    pub fn for_app_wrapper(app_wrapper: &AppWrapper) -> Self {
        Self::new(app_wrapper.namespace(), app_wrapper.name())
    }

    /// Map a labelled pod back to its owner. Pods missing either owner
    /// label are not ours and produce no request.
    pub fn for_pod(pod: &Pod) -> Option<Self> {
        let labels = pod.metadata.labels.as_ref()?;
        let namespace = labels.get(NAMESPACE_LABEL)?;
        let name = labels.get(NAME_LABEL)?;
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Sending half of the work queue. Cheap to clone; all clones share the
/// pending set that provides key dedup.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<ReconcileKey>,
    pending: Arc<Mutex<HashSet<ReconcileKey>>>,
}

impl QueueHandle {
    /// Enqueue a key unless it is already pending.
    pub fn enqueue(&self, key: ReconcileKey) {
        if self.pending.lock().insert(key.clone()) {
            // The receiver only disappears on shutdown.
            let _ = self.tx.send(key);
        }
    }

    /// Enqueue a key after a delay.
    pub fn enqueue_after(&self, key: ReconcileKey, delay: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.enqueue(key);
        });
    }

    /// Non-blocking dispatch trigger; coalesces through key dedup.
    pub fn trigger_dispatch_next(&self) {
        self.enqueue(ReconcileKey::dispatch_next());
    }

    /// Whether a key is currently pending. Mostly useful in tests.
    pub fn is_pending(&self, key: &ReconcileKey) -> bool {
        self.pending.lock().contains(key)
    }
}

/// Receiving half of the work queue, owned by the worker.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<ReconcileKey>,
    pending: Arc<Mutex<HashSet<ReconcileKey>>>,
}

impl QueueReceiver {
    /// Next key, or `None` when every handle is gone. A dequeued key stops
    /// being "pending", so it can be re-enqueued while being processed.
    pub async fn next(&mut self) -> Option<ReconcileKey> {
        let key = self.rx.recv().await?;
        self.pending.lock().remove(&key);
        Some(key)
    }

    /// Non-blocking variant for tests.
    pub fn try_next(&mut self) -> Option<ReconcileKey> {
        let key = self.rx.try_recv().ok()?;
        self.pending.lock().remove(&key);
        Some(key)
    }
}

/// Create a connected handle/receiver pair.
pub fn channel() -> (QueueHandle, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(Mutex::new(HashSet::new()));
    (
        QueueHandle {
            tx,
            pending: pending.clone(),
        },
        QueueReceiver { rx, pending },
    )
}

/// Serial queue consumer.
pub struct Worker {
    reconciler: Arc<Reconciler>,
    handle: QueueHandle,
    receiver: QueueReceiver,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    retries: HashMap<ReconcileKey, u32>,
}

impl Worker {
    pub fn new(
        reconciler: Arc<Reconciler>,
        handle: QueueHandle,
        receiver: QueueReceiver,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            reconciler,
            handle,
            receiver,
            retry_base_delay: config.retry_base_delay(),
            retry_max_delay: config.retry_max_delay(),
            retries: HashMap::new(),
        }
    }

    /// Drain the queue until cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("reconciliation worker starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                key = self.receiver.next() => {
                    let Some(key) = key else { break };
                    self.process(key).await;
                }
            }
        }
        tracing::info!("reconciliation worker stopped");
    }

    async fn process(&mut self, key: ReconcileKey) {
        match self.reconciler.reconcile(&key).await {
            Ok(outcome) => {
                self.retries.remove(&key);
                match outcome {
                    Outcome::Done => {}
                    Outcome::Requeue => self.handle.enqueue(key),
                    Outcome::RequeueAfter(delay) => self.handle.enqueue_after(key, delay),
                }
            }
            Err(err) => {
                let attempt = self.retries.entry(key.clone()).or_insert(0);
                *attempt += 1;
                let delay = retry_delay(self.retry_base_delay, self.retry_max_delay, *attempt);
                tracing::warn!(
                    key = %key,
                    attempt = *attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "reconciliation failed, retrying"
                );
                self.handle.enqueue_after(key, delay);
            }
        }
    }
}

/// Exponential backoff: base × 2^(attempt-1), capped.
fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(max)
}
