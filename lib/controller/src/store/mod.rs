// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Object store seam.
//!
//! The controller only ever talks to the cluster through [`ClusterStore`],
//! which captures the handful of reads and writes the state machine needs.
//! Two backends exist: [`KubeStore`] against a live API server and
//! [`MemoryStore`] for tests (with a staleness-injection mode to exercise
//! the phase cache).

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};

use crate::api::AppWrapper;
use crate::template::TaggedObject;

mod kube;
pub use self::kube::KubeStore;

mod memory;
pub use self::memory::MemoryStore;

/// Store errors, categorized so callers can ignore the benign kinds
/// (double-create, double-delete) and surface the rest for a retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    AlreadyExists,

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("object store request failed: {0}")]
    Api(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The cluster reads and writes the dispatcher needs.
///
/// Watch plumbing is intentionally absent: event sources push reconcile
/// keys into the work queue from outside (see the dispatcher binary), the
/// store only answers point-in-time questions.
#[async_trait]
pub trait ClusterStore: Send + Sync + 'static {
    /// Latest snapshot of one AppWrapper, `None` when it does not exist.
    async fn get_app_wrapper(&self, namespace: &str, name: &str)
        -> StoreResult<Option<AppWrapper>>;

    /// All AppWrappers across namespaces.
    async fn list_app_wrappers(&self) -> StoreResult<Vec<AppWrapper>>;

    /// Persist metadata changes (finalizers). Returns the stored object.
    async fn update_app_wrapper(&self, app_wrapper: &AppWrapper) -> StoreResult<AppWrapper>;

    /// Persist the status subresource. Returns the stored object.
    async fn update_status(&self, app_wrapper: &AppWrapper) -> StoreResult<AppWrapper>;

    /// All nodes.
    async fn list_nodes(&self) -> StoreResult<Vec<Node>>;

    /// Pods placed on a node, via the `spec.nodeName` field index.
    async fn list_pods_on_node(&self, node_name: &str) -> StoreResult<Vec<Pod>>;

    /// Pods carrying the owner labels of the given AppWrapper.
    async fn list_owned_pods(&self, namespace: &str, name: &str) -> StoreResult<Vec<Pod>>;

    /// Create a wrapped resource. `AlreadyExists` when it is present.
    async fn create_object(&self, object: &TaggedObject) -> StoreResult<()>;

    /// Delete a wrapped resource with background propagation. `NotFound`
    /// when it is absent.
    async fn delete_object(&self, object: &TaggedObject) -> StoreResult<()>;
}
