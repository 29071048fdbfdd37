// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end lifecycle tests against the in-memory store.
//!
//! Each test drives the reconciler by hand, the way the worker would, so
//! transitions are deterministic: a per-object key reconciles one
//! AppWrapper, the `*/*` key runs the dispatch selector.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::json;

use batchd_controller::api::UID_LABEL;
use batchd_controller::{
    channel, AppWrapper, AppWrapperSpec, ClusterStore, DispatcherConfig, MemoryStore, Outcome,
    Phase, QueueHandle, QueueReceiver, ReconcileKey, Reconciler, ResourceItem,
};

const GPU: &str = "nvidia.com/gpu";
const NS: &str = "default";

struct Harness {
    store: Arc<MemoryStore>,
    reconciler: Reconciler,
    handle: QueueHandle,
    receiver: QueueReceiver,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.add_node("gpu-node", GPU, 8);
    let config = DispatcherConfig {
        // Always recompute capacity; tests mutate the cluster freely.
        capacity_refresh_secs: 0,
        ..Default::default()
    };
    let (handle, receiver) = channel();
    let dyn_store: Arc<dyn ClusterStore> = store.clone();
    let reconciler = Reconciler::new(dyn_store, config, handle.clone());
    Harness {
        store,
        reconciler,
        handle,
        receiver,
    }
}

impl Harness {
    async fn reconcile(&self, key: &ReconcileKey) -> Outcome {
        self.reconciler.reconcile(key).await.unwrap()
    }

    async fn dispatch(&self) -> Outcome {
        self.reconcile(&ReconcileKey::dispatch_next()).await
    }

    async fn get(&self, name: &str) -> AppWrapper {
        self.store
            .get_app_wrapper(NS, name)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("AppWrapper {name} not found"))
    }

    async fn phase(&self, name: &str) -> Phase {
        self.get(name).await.phase()
    }

    /// Backdate a status timestamp so the slow-path branches fire.
    async fn backdate_dispatch(&self, name: &str, seconds: i64) {
        let mut app_wrapper = self.get(name).await;
        app_wrapper
            .status
            .as_mut()
            .unwrap()
            .last_dispatch_time = Some(Time(Utc::now() - chrono::Duration::seconds(seconds)));
        self.store.update_status(&app_wrapper).await.unwrap();
    }

    fn drain_queue(&mut self) {
        while self.receiver.try_next().is_some() {}
    }
}

fn app_wrapper(name: &str, priority: i32, gpus: i64, min_pods: i32, max_retries: i32) -> AppWrapper {
    let pod_name = format!("{name}-0");
    let spec = AppWrapperSpec {
        resources: vec![ResourceItem {
            template: json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": pod_name },
                "spec": {
                    "containers": [{
                        "name": "main",
                        "image": "train:latest",
                        "resources": { "requests": { "nvidia.com/gpu": gpus.to_string() } }
                    }]
                }
            }),
            replicas: 1,
            requests: BTreeMap::from([(GPU.to_string(), gpus)]),
        }],
        min_pods,
        priority,
        max_retries,
    };
    let mut app_wrapper = AppWrapper::new(name, spec);
    app_wrapper.metadata.namespace = Some(NS.to_string());
    app_wrapper
}

fn key(name: &str) -> ReconcileKey {
    ReconcileKey::new(NS, name)
}

fn assert_status_invariants(app_wrapper: &AppWrapper) {
    let status = app_wrapper.status.as_ref().expect("status must be set");
    let last = status.conditions.last().expect("conditions must be logged");
    assert_eq!(status.phase.to_string(), last.reason);
    assert!(status.requeued <= app_wrapper.spec.max_retries);
}

/// A single AppWrapper under capacity runs to completion.
#[tokio::test]
async fn test_single_admission_under_capacity() {
    let h = harness();
    h.store.insert_app_wrapper(app_wrapper("a", 1, 8, 1, 0));

    // Empty: finalizer first, then Queued.
    assert_eq!(h.reconcile(&key("a")).await, Outcome::Done);
    let queued = h.get("a").await;
    assert!(queued.has_finalizer());
    assert_eq!(queued.phase(), Phase::Queued);
    assert_status_invariants(&queued);

    // Queued -> Dispatching through the selector.
    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    let dispatching = h.get("a").await;
    assert_eq!(dispatching.phase(), Phase::Dispatching);
    assert!(dispatching
        .status
        .as_ref()
        .unwrap()
        .last_dispatch_time
        .is_some());

    // Dispatching -> Running creates the wrapped pod.
    assert_eq!(h.reconcile(&key("a")).await, Outcome::Done);
    assert_eq!(h.phase("a").await, Phase::Running);
    let pods = h.store.list_owned_pods(NS, "a").await.unwrap();
    assert_eq!(pods.len(), 1);
    let labels = pods[0].metadata.labels.as_ref().unwrap();
    assert_eq!(labels.get(UID_LABEL), Some(&h.get("a").await.uid().to_string()));

    // Pod still pending: recheck soon.
    assert!(matches!(
        h.reconcile(&key("a")).await,
        Outcome::RequeueAfter(_)
    ));
    assert_eq!(h.phase("a").await, Phase::Running);

    // Pod succeeds: Running -> Succeeded, finalizer stays until deletion.
    h.store.set_pod_phase(NS, "a-0", "Succeeded");
    assert_eq!(h.reconcile(&key("a")).await, Outcome::Done);
    let done = h.get("a").await;
    assert_eq!(done.phase(), Phase::Succeeded);
    assert!(done.has_finalizer());
    assert_status_invariants(&done);

    let reasons: Vec<&str> = done
        .status
        .as_ref()
        .unwrap()
        .conditions
        .iter()
        .map(|c| c.reason.as_str())
        .collect();
    assert_eq!(
        reasons,
        vec!["Queued", "Dispatching", "Running", "Succeeded"]
    );
}

/// Equal priority contends for capacity; the second AppWrapper waits
/// for the first to leave an active phase.
#[tokio::test]
async fn test_queue_under_contention() {
    let mut h = harness();
    let mut a = app_wrapper("a", 1, 8, 1, 0);
    a.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::seconds(5)));
    h.store.insert_app_wrapper(a);
    h.store.insert_app_wrapper(app_wrapper("b", 1, 8, 1, 0));

    h.reconcile(&key("a")).await;
    h.reconcile(&key("b")).await;

    // A is older, dispatches first; the queue is not drained yet.
    assert_eq!(h.dispatch().await, Outcome::Requeue);
    assert_eq!(h.phase("a").await, Phase::Dispatching);
    assert_eq!(h.phase("b").await, Phase::Queued);

    // B does not fit next to A's commitment.
    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    assert_eq!(h.phase("b").await, Phase::Queued);

    // A runs to completion; leaving the active phases triggers dispatch.
    h.reconcile(&key("a")).await;
    h.store.set_pod_phase(NS, "a-0", "Succeeded");
    h.drain_queue();
    h.reconcile(&key("a")).await;
    assert_eq!(h.phase("a").await, Phase::Succeeded);
    assert!(h.handle.is_pending(&ReconcileKey::dispatch_next()));

    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    assert_eq!(h.phase("b").await, Phase::Dispatching);
}

/// Priority beats creation order on the next dispatch pass.
#[tokio::test]
async fn test_priority_ordering() {
    let h = harness();
    h.store.insert_app_wrapper(app_wrapper("a", 1, 8, 1, 0));
    h.reconcile(&key("a")).await;
    h.dispatch().await;
    h.reconcile(&key("a")).await; // Running, holding all GPUs

    let mut c = app_wrapper("c", 0, 8, 1, 0);
    c.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::seconds(2)));
    h.store.insert_app_wrapper(c);
    let mut d = app_wrapper("d", 2, 8, 1, 0);
    d.metadata.creation_timestamp = Some(Time(Utc::now()));
    h.store.insert_app_wrapper(d);
    h.reconcile(&key("c")).await;
    h.reconcile(&key("d")).await;

    // Nothing fits while A is committed.
    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    assert_eq!(h.phase("c").await, Phase::Queued);
    assert_eq!(h.phase("d").await, Phase::Queued);

    h.store.set_pod_phase(NS, "a-0", "Succeeded");
    h.reconcile(&key("a")).await;

    // D is younger but higher priority: it must win.
    assert_eq!(h.dispatch().await, Outcome::Requeue);
    assert_eq!(h.phase("d").await, Phase::Dispatching);
    assert_eq!(h.phase("c").await, Phase::Queued);
}

/// Slow pod creation requeues until the retry budget is exhausted.
#[tokio::test]
async fn test_requeue_on_slow_dispatch() {
    let h = harness();
    h.store.insert_app_wrapper(app_wrapper("r", 1, 8, 1, 1));

    h.reconcile(&key("r")).await;
    h.dispatch().await;
    h.reconcile(&key("r")).await;
    assert_eq!(h.phase("r").await, Phase::Running);

    // Pod stays pending past the creation timeout.
    h.backdate_dispatch("r", 30).await;
    h.reconcile(&key("r")).await;
    let requeuing = h.get("r").await;
    assert_eq!(requeuing.phase(), Phase::Requeuing);
    assert_eq!(requeuing.status.as_ref().unwrap().requeued, 1);
    assert_status_invariants(&requeuing);

    // Teardown: first pass deletes the pod, second finds it gone.
    assert!(matches!(
        h.reconcile(&key("r")).await,
        Outcome::RequeueAfter(_)
    ));
    assert_eq!(h.store.pod_count(), 0);
    h.reconcile(&key("r")).await;
    assert_eq!(h.phase("r").await, Phase::Queued);

    // Second attempt times out as well; the budget is spent.
    h.dispatch().await;
    h.reconcile(&key("r")).await;
    assert_eq!(h.phase("r").await, Phase::Running);
    h.backdate_dispatch("r", 30).await;
    h.reconcile(&key("r")).await;

    let failed = h.get("r").await;
    assert_eq!(failed.phase(), Phase::Failed);
    assert_eq!(failed.status.as_ref().unwrap().requeued, 1);
    assert_status_invariants(&failed);
}

/// User deletion while Running tears down, removes the finalizer, and
/// triggers another dispatch pass.
#[tokio::test]
async fn test_user_deletion_while_running() {
    let mut h = harness();
    h.store.insert_app_wrapper(app_wrapper("d", 1, 8, 1, 0));
    h.reconcile(&key("d")).await;
    h.dispatch().await;
    h.reconcile(&key("d")).await;
    assert_eq!(h.phase("d").await, Phase::Running);
    let uid = h.get("d").await.uid().to_string();

    h.store.mark_deleted(NS, "d");
    h.drain_queue();

    // First pass deletes the wrapped pod.
    assert!(matches!(
        h.reconcile(&key("d")).await,
        Outcome::RequeueAfter(_)
    ));
    assert_eq!(h.store.pod_count(), 0);
    assert!(h.store.contains_app_wrapper(NS, "d"));

    // Second pass removes the finalizer and the object disappears.
    assert_eq!(h.reconcile(&key("d")).await, Outcome::Done);
    assert!(!h.store.contains_app_wrapper(NS, "d"));
    assert!(!h.reconciler.phase_cache().contains(&uid));
    assert!(h.handle.is_pending(&ReconcileKey::dispatch_next()));
}

/// A stale list right after a dispatch must not double-dispatch.
#[tokio::test]
async fn test_cache_staleness_resilience() {
    let h = harness();
    h.store.insert_app_wrapper(app_wrapper("s", 1, 8, 1, 0));
    h.reconcile(&key("s")).await;

    // The store list stops reflecting writes from here on.
    h.store.freeze_lists();

    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    let dispatched = h.get("s").await;
    assert_eq!(dispatched.phase(), Phase::Dispatching);
    let conditions = dispatched.condition_count();

    // The next pass sees the stale Queued phase in the list, but the cache
    // overlay reports the AppWrapper as committed: nothing to dispatch.
    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    let after = h.get("s").await;
    assert_eq!(after.phase(), Phase::Dispatching);
    assert_eq!(after.condition_count(), conditions);

    // Once the list catches up the overlay is unnecessary and accurate.
    h.store.thaw_lists();
    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    assert_eq!(h.get("s").await.condition_count(), conditions);
}

/// A reconciliation for a non-existent AppWrapper is a no-op.
#[tokio::test]
async fn test_missing_app_wrapper_is_noop() {
    let h = harness();
    assert_eq!(h.reconcile(&key("ghost")).await, Outcome::Done);
}

/// Foreign pods on a node reduce the capacity available for dispatch.
#[tokio::test]
async fn test_foreign_pods_reduce_capacity() {
    let h = harness();

    let mut foreign = k8s_openapi::api::core::v1::Pod::default();
    foreign.metadata.name = Some("intruder".to_string());
    foreign.metadata.namespace = Some(NS.to_string());
    foreign.spec = Some(k8s_openapi::api::core::v1::PodSpec {
        node_name: Some("gpu-node".to_string()),
        containers: vec![k8s_openapi::api::core::v1::Container {
            name: "main".to_string(),
            resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    GPU.to_string(),
                    k8s_openapi::apimachinery::pkg::api::resource::Quantity("2".to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    });
    h.store.insert_pod(foreign);

    h.store.insert_app_wrapper(app_wrapper("big", 1, 8, 1, 0));
    h.reconcile(&key("big")).await;

    // 8 allocatable minus 2 foreign leaves 6: the request does not fit.
    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    assert_eq!(h.phase("big").await, Phase::Queued);

    // A smaller AppWrapper fits into the remainder.
    h.store.insert_app_wrapper(app_wrapper("small", 1, 6, 1, 0));
    h.reconcile(&key("small")).await;
    assert!(matches!(h.dispatch().await, Outcome::RequeueAfter(_)));
    assert_eq!(h.phase("small").await, Phase::Dispatching);
    assert_eq!(h.phase("big").await, Phase::Queued);
}

/// An unparseable template fails the AppWrapper at creation time.
#[tokio::test]
async fn test_parse_failure_fails_dispatching() {
    let h = harness();
    let mut broken = app_wrapper("broken", 1, 4, 1, 3);
    broken.spec.resources[0].template = json!({ "kind": "Pod" });
    h.store.insert_app_wrapper(broken);

    h.reconcile(&key("broken")).await;
    h.dispatch().await;
    assert_eq!(h.phase("broken").await, Phase::Dispatching);

    assert_eq!(h.reconcile(&key("broken")).await, Outcome::Done);
    let failed = h.get("broken").await;
    assert_eq!(failed.phase(), Phase::Failed);
    // The retry budget does not apply to unparseable templates.
    assert_eq!(failed.status.as_ref().unwrap().requeued, 0);
    assert_status_invariants(&failed);
}
