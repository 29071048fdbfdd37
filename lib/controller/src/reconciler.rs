// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-object state machine.
//!
//! Normal reconciliations (`namespace/name`) implement every phase
//! transition except Queued → Dispatching. That one transition is a global
//! decision and happens in the special `*/*` reconciliation, which invokes
//! the dispatch selector (see `dispatch.rs`) to pick the next admissible
//! AppWrapper in priority+age order.
//!
//! Before acting on a snapshot, the phase cache is consulted: there is no
//! point working on an AppWrapper the store has served stale, the status
//! write would only conflict.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::Mutex;
use tokio::time::Duration;

use crate::api::{AppWrapper, AppWrapperCondition, Phase};
use crate::cache::PhaseCache;
use crate::config::DispatcherConfig;
use crate::dispatch::CapacityState;
use crate::queue::{QueueHandle, ReconcileKey};
use crate::store::ClusterStore;
use crate::template;
use crate::{raise, Result};

/// What the worker should do with the key after a successful pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Requeue,
    RequeueAfter(Duration),
}

/// Status summary of the pods owned by one AppWrapper.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PodCounts {
    pub failed: i32,
    pub succeeded: i32,
    pub running: i32,
    pub other: i32,
}

pub struct Reconciler {
    pub(crate) store: Arc<dyn ClusterStore>,
    pub(crate) cache: PhaseCache,
    pub(crate) capacity: Mutex<CapacityState>,
    pub(crate) config: DispatcherConfig,
    queue: QueueHandle,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ClusterStore>, config: DispatcherConfig, queue: QueueHandle) -> Self {
        Self {
            store,
            cache: PhaseCache::new(),
            capacity: Mutex::new(CapacityState::default()),
            config,
            queue,
        }
    }

    /// Read access to the phase cache, for observability and tests.
    pub fn phase_cache(&self) -> &PhaseCache {
        &self.cache
    }

    /// Reconcile one AppWrapper, or dispatch the next one on the sentinel.
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<Outcome> {
        if key.is_dispatch_next() {
            return self.reconcile_dispatch().await;
        }

        let Some(mut app_wrapper) = self
            .store
            .get_app_wrapper(&key.namespace, &key.name)
            .await?
        else {
            // No such AppWrapper, nothing to reconcile, not an error.
            return Ok(Outcome::Done);
        };

        self.cache
            .check(&app_wrapper, self.config.cache_conflict_timeout())?;

        if app_wrapper.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(app_wrapper).await;
        }

        match app_wrapper.phase() {
            Phase::Succeeded | Phase::Failed | Phase::Deleting => Ok(Outcome::Done),

            Phase::Queued => {
                // This AppWrapper is not necessarily the head of the queue;
                // admission is a global decision.
                self.queue.trigger_dispatch_next();
                Ok(Outcome::Done)
            }

            Phase::Dispatching => {
                if self.is_slow_creation(&app_wrapper) {
                    return self.requeue_or_fail(&mut app_wrapper).await;
                }
                let objects = match template::parse_resources(&app_wrapper) {
                    Ok(objects) => objects,
                    Err(err) => {
                        tracing::error!(
                            key = %key,
                            error = %err,
                            "template parsing failed during creation"
                        );
                        self.update_status(&mut app_wrapper, Phase::Failed).await?;
                        return Ok(Outcome::Done);
                    }
                };
                template::create_all(self.store.as_ref(), &objects).await?;
                // Running only after successfully requesting every creation.
                self.update_status(&mut app_wrapper, Phase::Running).await?;
                Ok(Outcome::Done)
            }

            Phase::Running => {
                let counts = self.monitor_pods(&app_wrapper).await?;
                let slow = self.is_slow_creation(&app_wrapper);
                if counts.failed > 0
                    || slow && (counts.other > 0 || counts.running < app_wrapper.spec.min_pods)
                {
                    return self.requeue_or_fail(&mut app_wrapper).await;
                }
                if app_wrapper.spec.min_pods > 0
                    && counts.succeeded >= app_wrapper.spec.min_pods
                    && counts.running == 0
                    && counts.other == 0
                {
                    self.update_status(&mut app_wrapper, Phase::Succeeded).await?;
                    return Ok(Outcome::Done);
                }
                if !slow {
                    // Pods are still settling; check again soon.
                    return Ok(Outcome::RequeueAfter(self.config.creation_delay()));
                }
                // Only check again on pod change.
                Ok(Outcome::Done)
            }

            Phase::Requeuing => {
                let pending = template::delete_all(self.store.as_ref(), &app_wrapper).await?;
                if pending.total() > 0 {
                    if self.is_slow_deletion(&app_wrapper) {
                        // Give up requeuing and fail instead.
                        self.update_status(&mut app_wrapper, Phase::Failed).await?;
                        return Ok(Outcome::Done);
                    }
                    return Ok(Outcome::RequeueAfter(self.config.deletion_delay()));
                }
                self.update_status(&mut app_wrapper, Phase::Queued).await?;
                Ok(Outcome::Done)
            }

            Phase::Empty => {
                if app_wrapper.add_finalizer() {
                    app_wrapper = self.store.update_app_wrapper(&app_wrapper).await?;
                }
                // Queued only after the finalizer is in place.
                self.update_status(&mut app_wrapper, Phase::Queued).await?;
                Ok(Outcome::Done)
            }
        }
    }

    /// The `*/*` pass: pick the next admissible AppWrapper and dispatch it.
    async fn reconcile_dispatch(&self) -> Result<Outcome> {
        let (selected, last) = self.dispatch_next().await?;
        let Some(mut app_wrapper) = selected else {
            // Nothing eligible; retry later.
            return Ok(Outcome::RequeueAfter(self.config.dispatch_delay()));
        };
        self.cache
            .check(&app_wrapper, self.config.cache_conflict_timeout())?;
        if app_wrapper.phase() != Phase::Queued {
            // The selector only ever picks Queued candidates; anything else
            // means the caches are inconsistent.
            raise!(
                "dispatch candidate {}/{} is not queued",
                app_wrapper.namespace(),
                app_wrapper.name()
            );
        }
        let now = Time(Utc::now());
        app_wrapper
            .status
            .get_or_insert_with(Default::default)
            .last_dispatch_time = Some(now);
        self.update_status(&mut app_wrapper, Phase::Dispatching).await?;
        if last {
            // Queue drained; retry later.
            return Ok(Outcome::RequeueAfter(self.config.dispatch_delay()));
        }
        // More queued AppWrappers may be admissible; keep draining.
        Ok(Outcome::Requeue)
    }

    /// Teardown after a user deletion.
    async fn handle_deletion(&self, mut app_wrapper: AppWrapper) -> Result<Outcome> {
        let pending = template::delete_all(self.store.as_ref(), &app_wrapper).await?;
        if pending.dispatched > 0 {
            return Ok(Outcome::RequeueAfter(self.config.deletion_delay()));
        }
        if pending.unparseable > 0 {
            if !(self.config.orphan_unparseable && self.is_slow_teardown(&app_wrapper)) {
                return Ok(Outcome::RequeueAfter(self.config.deletion_delay()));
            }
            tracing::error!(
                namespace = app_wrapper.namespace(),
                name = app_wrapper.name(),
                unparseable = pending.unparseable,
                "removing finalizer despite unparseable templates, wrapped objects may be orphaned"
            );
        }
        if app_wrapper.remove_finalizer() {
            self.store.update_app_wrapper(&app_wrapper).await?;
        }
        tracing::info!(
            namespace = app_wrapper.namespace(),
            name = app_wrapper.name(),
            "deleted"
        );
        self.cache.remove(app_wrapper.uid());
        if app_wrapper.phase().is_committed() {
            // Cluster may have more available capacity.
            self.queue.trigger_dispatch_next();
        }
        Ok(Outcome::Done)
    }

    /// Append a condition, persist the status, refresh the phase cache, and
    /// trigger a dispatch when capacity may have been freed.
    pub(crate) async fn update_status(
        &self,
        app_wrapper: &mut AppWrapper,
        phase: Phase,
    ) -> Result<()> {
        let status = app_wrapper.status.get_or_insert_with(Default::default);
        // Condition timestamps stay consistent with the status fields they
        // mirror.
        let transition_time = match phase {
            Phase::Dispatching => status.last_dispatch_time.clone(),
            Phase::Requeuing => status.last_requeuing_time.clone(),
            _ => None,
        }
        .unwrap_or_else(|| Time(Utc::now()));
        let active_before = status.phase.is_active();
        status.conditions.push(AppWrapperCondition {
            last_transition_time: transition_time,
            reason: phase.to_string(),
        });
        status.phase = phase;

        *app_wrapper = self.store.update_status(app_wrapper).await?;

        tracing::info!(
            namespace = app_wrapper.namespace(),
            name = app_wrapper.name(),
            phase = %phase,
            "phase transition"
        );
        self.cache
            .record(app_wrapper.uid(), phase, app_wrapper.condition_count());
        if active_before && !phase.is_active() {
            // Cluster may have more available capacity.
            self.queue.trigger_dispatch_next();
        }
        Ok(())
    }

    /// Requeue when the retry budget allows, fail otherwise.
    async fn requeue_or_fail(&self, app_wrapper: &mut AppWrapper) -> Result<Outcome> {
        let status = app_wrapper.status.get_or_insert_with(Default::default);
        if status.requeued < app_wrapper.spec.max_retries {
            status.requeued += 1;
            status.last_requeuing_time = Some(Time(Utc::now()));
            self.update_status(app_wrapper, Phase::Requeuing).await?;
        } else {
            self.update_status(app_wrapper, Phase::Failed).await?;
        }
        Ok(Outcome::Done)
    }

    /// Summarize the pods owned by an AppWrapper.
    async fn monitor_pods(&self, app_wrapper: &AppWrapper) -> Result<PodCounts> {
        let pods = self
            .store
            .list_owned_pods(app_wrapper.namespace(), app_wrapper.name())
            .await?;
        let mut counts = PodCounts::default();
        for pod in &pods {
            match pod
                .status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
            {
                Some("Succeeded") => counts.succeeded += 1,
                Some("Failed") => counts.failed += 1,
                Some("Running") => counts.running += 1,
                _ => counts.other += 1,
            }
        }
        Ok(counts)
    }

    fn is_slow_creation(&self, app_wrapper: &AppWrapper) -> bool {
        let last_dispatch = app_wrapper
            .status
            .as_ref()
            .and_then(|status| status.last_dispatch_time.as_ref());
        elapsed_exceeds(last_dispatch, self.config.creation_timeout())
    }

    fn is_slow_deletion(&self, app_wrapper: &AppWrapper) -> bool {
        let last_requeuing = app_wrapper
            .status
            .as_ref()
            .and_then(|status| status.last_requeuing_time.as_ref());
        elapsed_exceeds(last_requeuing, self.config.deletion_timeout())
    }

    fn is_slow_teardown(&self, app_wrapper: &AppWrapper) -> bool {
        elapsed_exceeds(
            app_wrapper.metadata.deletion_timestamp.as_ref(),
            self.config.deletion_timeout(),
        )
    }
}

/// True when `since` is set and lies further than `timeout` in the past.
fn elapsed_exceeds(since: Option<&Time>, timeout: Duration) -> bool {
    let Some(since) = since else {
        return false;
    };
    Utc::now()
        .signed_duration_since(since.0)
        .to_std()
        .map(|elapsed| elapsed > timeout)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_elapsed_exceeds() {
        let timeout = Duration::from_secs(20);
        assert!(!elapsed_exceeds(None, timeout));

        let recent = Time(Utc::now());
        assert!(!elapsed_exceeds(Some(&recent), timeout));

        let old = Time(Utc::now() - ChronoDuration::seconds(30));
        assert!(elapsed_exceeds(Some(&old), timeout));

        // A timestamp in the future never reads as slow.
        let future = Time(Utc::now() + ChronoDuration::seconds(30));
        assert!(!elapsed_exceeds(Some(&future), timeout));
    }
}
