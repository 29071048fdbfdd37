// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory backend for [`ClusterStore`], used by tests.
//!
//! Besides the plain store semantics it offers two fixtures:
//! - pods created through wrapped-resource templates materialize as real
//!   `Pod` objects whose phase tests can flip;
//! - [`MemoryStore::freeze_lists`] pins `list_app_wrappers` to a snapshot,
//!   reproducing the read-after-write staleness of the real store cache.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use parking_lot::Mutex;

use crate::api::{AppWrapper, NAMESPACE_LABEL, NAME_LABEL};
use crate::store::{ClusterStore, StoreError, StoreResult};
use crate::template::TaggedObject;

#[derive(Default)]
struct Inner {
    app_wrappers: BTreeMap<(String, String), AppWrapper>,
    pods: BTreeMap<(String, String), Pod>,
    nodes: BTreeMap<String, Node>,
    objects: BTreeMap<(String, String, String), DynamicObject>,
    frozen_list: Option<Vec<AppWrapper>>,
    uid_counter: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an AppWrapper, assigning a UID and creation timestamp when
    /// absent (the way the API server would on create).
    pub fn insert_app_wrapper(&self, mut app_wrapper: AppWrapper) {
        let mut inner = self.inner.lock();
        if app_wrapper.metadata.uid.is_none() {
            inner.uid_counter += 1;
            app_wrapper.metadata.uid = Some(format!("uid-{}", inner.uid_counter));
        }
        if app_wrapper.metadata.creation_timestamp.is_none() {
            app_wrapper.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        let key = (
            app_wrapper.namespace().to_string(),
            app_wrapper.name().to_string(),
        );
        inner.app_wrappers.insert(key, app_wrapper);
    }

    pub fn contains_app_wrapper(&self, namespace: &str, name: &str) -> bool {
        self.inner
            .lock()
            .app_wrappers
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    /// Stamp a deletion timestamp, as a user deletion would.
    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(app_wrapper) = inner
            .app_wrappers
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            app_wrapper.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    pub fn insert_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.inner.lock().nodes.insert(name, node);
    }

    /// A schedulable node exposing `count` units of `resource`.
    pub fn add_node(&self, name: &str, resource: &str, count: i64) {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.status = Some(k8s_openapi::api::core::v1::NodeStatus {
            allocatable: Some(BTreeMap::from([(
                resource.to_string(),
                Quantity(count.to_string()),
            )])),
            ..Default::default()
        });
        self.insert_node(node);
    }

    pub fn insert_pod(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.inner.lock().pods.insert(key, pod);
    }

    pub fn pod_count(&self) -> usize {
        self.inner.lock().pods.len()
    }

    /// Flip the phase of a pod, as the kubelet would report it.
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) {
        let mut inner = self.inner.lock();
        if let Some(pod) = inner
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            pod.status
                .get_or_insert_with(Default::default)
                .phase = Some(phase.to_string());
        }
    }

    /// Pin `list_app_wrappers` to the current contents, simulating a store
    /// cache that has not caught up with subsequent writes.
    pub fn freeze_lists(&self) {
        let mut inner = self.inner.lock();
        let snapshot: Vec<AppWrapper> = inner.app_wrappers.values().cloned().collect();
        inner.frozen_list = Some(snapshot);
    }

    pub fn thaw_lists(&self) {
        self.inner.lock().frozen_list = None;
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_app_wrapper(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<AppWrapper>> {
        Ok(self
            .inner
            .lock()
            .app_wrappers
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_app_wrappers(&self) -> StoreResult<Vec<AppWrapper>> {
        let inner = self.inner.lock();
        if let Some(frozen) = &inner.frozen_list {
            return Ok(frozen.clone());
        }
        Ok(inner.app_wrappers.values().cloned().collect())
    }

    async fn update_app_wrapper(&self, app_wrapper: &AppWrapper) -> StoreResult<AppWrapper> {
        let mut inner = self.inner.lock();
        let key = (
            app_wrapper.namespace().to_string(),
            app_wrapper.name().to_string(),
        );
        if !inner.app_wrappers.contains_key(&key) {
            return Err(StoreError::NotFound);
        }
        // Finalizer removal on a deleted object completes its removal.
        if app_wrapper.metadata.deletion_timestamp.is_some()
            && app_wrapper
                .metadata
                .finalizers
                .as_ref()
                .map(|f| f.is_empty())
                .unwrap_or(true)
        {
            inner.app_wrappers.remove(&key);
            return Ok(app_wrapper.clone());
        }
        inner.app_wrappers.insert(key, app_wrapper.clone());
        Ok(app_wrapper.clone())
    }

    async fn update_status(&self, app_wrapper: &AppWrapper) -> StoreResult<AppWrapper> {
        let mut inner = self.inner.lock();
        let key = (
            app_wrapper.namespace().to_string(),
            app_wrapper.name().to_string(),
        );
        let Some(stored) = inner.app_wrappers.get_mut(&key) else {
            return Err(StoreError::NotFound);
        };
        stored.status = app_wrapper.status.clone();
        Ok(stored.clone())
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        Ok(self.inner.lock().nodes.values().cloned().collect())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> StoreResult<Vec<Pod>> {
        Ok(self
            .inner
            .lock()
            .pods
            .values()
            .filter(|pod| {
                pod.spec
                    .as_ref()
                    .and_then(|spec| spec.node_name.as_deref())
                    == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn list_owned_pods(&self, namespace: &str, name: &str) -> StoreResult<Vec<Pod>> {
        Ok(self
            .inner
            .lock()
            .pods
            .values()
            .filter(|pod| {
                let labels = pod.metadata.labels.as_ref();
                labels.and_then(|l| l.get(NAMESPACE_LABEL)).map(String::as_str)
                    == Some(namespace)
                    && labels.and_then(|l| l.get(NAME_LABEL)).map(String::as_str) == Some(name)
            })
            .cloned()
            .collect())
    }

    async fn create_object(&self, object: &TaggedObject) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let key = (
            object.kind().to_string(),
            object.namespace().to_string(),
            object.name().to_string(),
        );
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        inner.objects.insert(key, object.object.clone());

        // Materialize pods so the Running-phase monitoring has something to
        // observe; other kinds only exist as opaque objects.
        if object.kind() == "Pod" {
            let value = serde_json::to_value(&object.object)
                .map_err(|err| StoreError::Api(err.to_string()))?;
            let mut pod: Pod = serde_json::from_value(value)
                .map_err(|err| StoreError::Api(err.to_string()))?;
            if pod.metadata.namespace.is_none() {
                pod.metadata.namespace = Some(object.namespace().to_string());
            }
            let status = pod.status.get_or_insert_with(Default::default);
            if status.phase.is_none() {
                status.phase = Some("Pending".to_string());
            }
            let key = (
                pod.metadata.namespace.clone().unwrap_or_default(),
                pod.metadata.name.clone().unwrap_or_default(),
            );
            inner.pods.insert(key, pod);
        }
        Ok(())
    }

    async fn delete_object(&self, object: &TaggedObject) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let key = (
            object.kind().to_string(),
            object.namespace().to_string(),
            object.name().to_string(),
        );
        if inner.objects.remove(&key).is_none() {
            return Err(StoreError::NotFound);
        }
        if object.kind() == "Pod" {
            inner
                .pods
                .remove(&(object.namespace().to_string(), object.name().to_string()));
        }
        Ok(())
    }
}
