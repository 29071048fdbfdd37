// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! AppWrapper custom resource types.
//!
//! An AppWrapper bundles templated cluster resources with aggregate
//! scheduling requirements (total GPU request, minimum ready pods, priority,
//! retry budget). The CRD schema is managed externally; this module defines
//! the Rust view of it plus the small helpers the controller needs
//! (finalizer management, owner labels, phase predicates).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::weights::Weights;

/// Owner namespace label for wrapped resources.
pub const NAMESPACE_LABEL: &str = "batchd.io/namespace";
/// Owner name label for wrapped resources.
pub const NAME_LABEL: &str = "batchd.io/name";
/// Owner UID label for wrapped resources.
pub const UID_LABEL: &str = "batchd.io/uid";
/// Finalizer blocking AppWrapper removal until wrapped resources are gone.
pub const FINALIZER: &str = "batchd.io/finalizer";

/// Spec for the AppWrapper custom resource.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "batchd.io",
    version = "v1alpha1",
    kind = "AppWrapper",
    namespaced,
    status = "AppWrapperStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperSpec {
    /// Ordered list of wrapped resource templates.
    #[serde(default)]
    pub resources: Vec<ResourceItem>,

    /// Minimum number of pods that must reach Running for success.
    #[serde(default)]
    pub min_pods: i32,

    /// Dispatch priority; higher dispatches first.
    #[serde(default)]
    pub priority: i32,

    /// Requeue budget before the AppWrapper is failed.
    #[serde(default)]
    pub max_retries: i32,
}

/// One templated resource plus its per-replica resource requests.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceItem {
    /// Raw template for the wrapped resource, decoded lazily at
    /// creation/deletion time.
    #[serde(default)]
    pub template: serde_json::Value,

    /// Number of replicas the template stands for.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Per-replica resource requests counted against cluster capacity.
    #[serde(default)]
    pub requests: BTreeMap<String, i64>,
}

fn default_replicas() -> i32 {
    1
}

/// Status of the AppWrapper custom resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperStatus {
    #[serde(default)]
    pub phase: Phase,

    /// Number of requeues so far, bounded by `spec.maxRetries`.
    #[serde(default)]
    pub requeued: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dispatch_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_requeuing_time: Option<Time>,

    /// Transition log. The length of this list only ever grows for a given
    /// UID, which makes it a reliable recency indicator for the phase cache.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AppWrapperCondition>,
}

/// One phase transition, recorded in `status.conditions`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperCondition {
    pub last_transition_time: Time,
    pub reason: String,
}

/// Coarse lifecycle state of an AppWrapper.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Freshly created, not yet observed by the controller.
    #[default]
    Empty,
    /// Waiting for admission.
    Queued,
    /// Admitted; wrapped resources are being created.
    Dispatching,
    /// Wrapped resources created; pods are being monitored.
    Running,
    Succeeded,
    Failed,
    /// Wrapped resources are being torn down ahead of another dispatch.
    Requeuing,
    /// Teardown after a user deletion.
    Deleting,
}

impl Phase {
    /// Active phases hold cluster capacity; leaving one frees capacity and
    /// warrants a dispatch trigger.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Dispatching | Phase::Running | Phase::Requeuing)
    }

    /// Phases counted as committed capacity by the dispatch selector.
    pub fn is_committed(&self) -> bool {
        self.is_active() || matches!(self, Phase::Deleting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Empty => "Empty",
            Phase::Queued => "Queued",
            Phase::Dispatching => "Dispatching",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Requeuing => "Requeuing",
            Phase::Deleting => "Deleting",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Empty" => Ok(Phase::Empty),
            "Queued" => Ok(Phase::Queued),
            "Dispatching" => Ok(Phase::Dispatching),
            "Running" => Ok(Phase::Running),
            "Succeeded" => Ok(Phase::Succeeded),
            "Failed" => Ok(Phase::Failed),
            "Requeuing" => Ok(Phase::Requeuing),
            "Deleting" => Ok(Phase::Deleting),
            _ => Err(anyhow::anyhow!("unknown AppWrapper phase: '{}'", s)),
        }
    }
}

impl AppWrapper {
    /// Stable unique id, empty for objects never persisted.
    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    pub fn condition_count(&self) -> usize {
        self.status
            .as_ref()
            .map(|status| status.conditions.len())
            .unwrap_or(0)
    }

    /// Aggregate request: Σ over resource items of replicas × requests,
    /// restricted to the counted resource names.
    pub fn request(&self, counted: &[String]) -> Weights {
        let mut request = Weights::new();
        for item in &self.spec.resources {
            request.add(&Weights::from_requests(&item.requests, counted).scaled(item.replicas as i64));
        }
        request
    }

    /// The three owner labels stamped on every wrapped resource.
    pub fn owner_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NAMESPACE_LABEL.to_string(), self.namespace().to_string()),
            (NAME_LABEL.to_string(), self.name().to_string()),
            (UID_LABEL.to_string(), self.uid().to_string()),
        ])
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| finalizers.iter().any(|f| f == FINALIZER))
    }

    /// Returns true if the finalizer was added (i.e. the object changed).
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER.to_string());
        true
    }

    /// Returns true if the finalizer was removed (i.e. the object changed).
    pub fn remove_finalizer(&mut self) -> bool {
        let Some(finalizers) = self.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != FINALIZER);
        before != finalizers.len()
    }
}
