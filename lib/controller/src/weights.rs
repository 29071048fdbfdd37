// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-dimensional resource weights.
//!
//! Capacity, commitments, and per-AppWrapper requests are all [`Weights`]:
//! a map from resource name to an integer count. Only one dimension is
//! tracked in practice (the configured GPU resource name) but every
//! comparison is component-wise so additional dimensions compose without
//! touching the accounting code.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

/// Resource counts keyed by resource name (e.g. `nvidia.com/gpu`).
///
/// Values may go negative transiently while subtracting commitments from
/// capacity; [`Weights::fits`] handles that correctly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weights(BTreeMap<String, i64>);

impl Weights {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-dimension weight, mostly useful in tests.
    pub fn of(name: &str, count: i64) -> Self {
        let mut weights = Self::new();
        weights.0.insert(name.to_string(), count);
        weights
    }

    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.values().all(|count| *count == 0)
    }

    /// Component-wise `self + other`.
    pub fn add(&mut self, other: &Weights) {
        for (name, count) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += count;
        }
    }

    /// Component-wise `self - other`.
    pub fn sub(&mut self, other: &Weights) {
        for (name, count) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) -= count;
        }
    }

    /// Component-wise `self × factor`.
    pub fn scaled(&self, factor: i64) -> Weights {
        Weights(
            self.0
                .iter()
                .map(|(name, count)| (name.clone(), count * factor))
                .collect(),
        )
    }

    /// True when every dimension of `self` is available in `available`.
    ///
    /// Dimensions absent from `available` count as zero, so a request for a
    /// resource the cluster does not expose never fits.
    pub fn fits(&self, available: &Weights) -> bool {
        self.0
            .iter()
            .all(|(name, count)| *count <= available.get(name))
    }

    /// Extract the counted resource names from a plain request map
    /// (AppWrapper resource items carry integer requests directly).
    pub fn from_requests(requests: &BTreeMap<String, i64>, counted: &[String]) -> Weights {
        Weights(
            requests
                .iter()
                .filter(|(name, _)| counted.iter().any(|c| c == *name))
                .map(|(name, count)| (name.clone(), *count))
                .collect(),
        )
    }

    /// Extract the counted resource names from a Kubernetes quantity map
    /// (node allocatable, container requests).
    pub fn from_quantities(
        quantities: Option<&BTreeMap<String, Quantity>>,
        counted: &[String],
    ) -> Weights {
        let mut weights = Weights::new();
        let Some(quantities) = quantities else {
            return weights;
        };
        for name in counted {
            if let Some(quantity) = quantities.get(name) {
                let count = quantity_value(quantity);
                if count != 0 {
                    weights.0.insert(name.clone(), count);
                }
            }
        }
        weights
    }

    /// Sum of the counted container requests of a pod.
    pub fn from_pod(pod: &Pod, counted: &[String]) -> Weights {
        let mut weights = Weights::new();
        let Some(spec) = pod.spec.as_ref() else {
            return weights;
        };
        for container in &spec.containers {
            let requests = container
                .resources
                .as_ref()
                .and_then(|resources| resources.requests.as_ref());
            weights.add(&Weights::from_quantities(requests, counted));
        }
        weights
    }
}

/// Integer value of a Kubernetes quantity.
///
/// Counted resources (GPUs) are whole numbers; anything unparseable counts
/// as zero rather than failing capacity computation.
fn quantity_value(quantity: &Quantity) -> i64 {
    quantity.0.parse::<i64>().unwrap_or(0)
}
