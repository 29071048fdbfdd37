// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dispatch selector and cluster capacity accounting.
//!
//! Admission is a global decision: given every Queued AppWrapper, pick the
//! next admissible one in `(priority desc, creation time asc)` order. An
//! AppWrapper is admissible when its aggregate request fits into the
//! cluster capacity left over by AppWrappers of equal or higher priority
//! that already hold capacity. Admitted work is never preempted, and
//! lower-priority commitments are ignored so a large high-priority
//! candidate cannot be starved by small early arrivals.
//!
//! Node-side capacity (allocatable GPUs minus foreign pod requests) changes
//! slowly and is refreshed at most once per `capacity_refresh_interval`;
//! AppWrapper commitments are recomputed on every pass from the (cache
//! overlaid) list.

use tokio::time::Instant;

use crate::api::{AppWrapper, Phase, UID_LABEL};
use crate::reconciler::Reconciler;
use crate::weights::Weights;
use crate::Result;

/// Cached node-side capacity.
#[derive(Default)]
pub(crate) struct CapacityState {
    weights: Weights,
    next_refresh: Option<Instant>,
}

impl Reconciler {
    /// Choose the next AppWrapper to dispatch.
    ///
    /// Returns the selected candidate (still Queued; the caller performs
    /// the transition) and whether it was the last queued one.
    pub(crate) async fn dispatch_next(&self) -> Result<(Option<AppWrapper>, bool)> {
        let app_wrappers = self.store.list_app_wrappers().await?;
        let capacity = self.capacity_with_refresh().await?;
        let counted = &self.config.resource_names;

        // Phases are overlaid with the phase cache so decisions written
        // moments ago are accounted for even if the store has not caught up.
        let mut committed: Vec<(i32, Weights)> = Vec::new();
        let mut queued: Vec<AppWrapper> = Vec::new();
        for app_wrapper in app_wrappers {
            let phase = self.cache.effective_phase(&app_wrapper);
            if phase.is_committed() {
                committed.push((app_wrapper.spec.priority, app_wrapper.request(counted)));
            } else if phase == Phase::Queued {
                queued.push(app_wrapper);
            }
        }

        queued.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then_with(|| creation_time(a).cmp(&creation_time(b)))
                .then_with(|| a.name().cmp(b.name()))
        });

        let total = queued.len();
        for (index, candidate) in queued.into_iter().enumerate() {
            // Capacity left for this candidate: everything of equal or
            // higher priority is uninterruptible.
            let mut available = capacity.clone();
            for (priority, request) in &committed {
                if *priority >= candidate.spec.priority {
                    available.sub(request);
                }
            }
            if candidate.request(counted).fits(&available) {
                let last = index + 1 == total;
                return Ok((Some(candidate), last));
            }
        }
        Ok((None, true))
    }

    /// Node-side capacity, recomputed at most once per refresh interval.
    async fn capacity_with_refresh(&self) -> Result<Weights> {
        {
            let state = self.capacity.lock();
            if let Some(next_refresh) = state.next_refresh {
                if Instant::now() < next_refresh {
                    return Ok(state.weights.clone());
                }
            }
        }
        let weights = self.compute_cluster_capacity().await?;
        tracing::debug!(capacity = ?weights, "cluster capacity refreshed");
        let mut state = self.capacity.lock();
        state.weights = weights.clone();
        state.next_refresh = Some(Instant::now() + self.config.capacity_refresh_interval());
        Ok(weights)
    }

    /// Sum of allocatable counted resources over schedulable nodes, minus
    /// the requests of non-terminal foreign pods placed on them.
    async fn compute_cluster_capacity(&self) -> Result<Weights> {
        let counted = &self.config.resource_names;
        let mut capacity = Weights::new();
        for node in self.store.list_nodes().await? {
            if node
                .spec
                .as_ref()
                .and_then(|spec| spec.unschedulable)
                .unwrap_or(false)
            {
                continue;
            }
            let allocatable = node
                .status
                .as_ref()
                .and_then(|status| status.allocatable.as_ref());
            let node_weights = Weights::from_quantities(allocatable, counted);
            if node_weights.is_zero() {
                continue;
            }
            capacity.add(&node_weights);

            let node_name = node.metadata.name.as_deref().unwrap_or("");
            for pod in self.store.list_pods_on_node(node_name).await? {
                let terminal = matches!(
                    pod.status
                        .as_ref()
                        .and_then(|status| status.phase.as_deref()),
                    Some("Succeeded") | Some("Failed")
                );
                let foreign = !pod
                    .metadata
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.contains_key(UID_LABEL));
                if !terminal && foreign {
                    // Foreign workloads consume capacity we cannot dispatch.
                    capacity.sub(&Weights::from_pod(&pod, counted));
                }
            }
        }
        Ok(capacity)
    }
}

fn creation_time(app_wrapper: &AppWrapper) -> Option<chrono::DateTime<chrono::Utc>> {
    app_wrapper
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
}
