// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! batchd controller
//!
//! Cluster-level dispatcher for GPU-bearing batch jobs. AppWrappers bundle
//! templated cluster resources with aggregate scheduling requirements; the
//! controller admits them only when sufficient GPU capacity is available,
//! creates the wrapped resources, monitors the resulting pods, and drives
//! each AppWrapper to success, failure, or deletion.

pub use anyhow::{anyhow as error, bail as raise, Context as ErrorContext, Error, Result};

pub mod api;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod template;
pub mod weights;

pub use api::{AppWrapper, AppWrapperSpec, AppWrapperStatus, Phase, ResourceItem};
pub use config::DispatcherConfig;
pub use queue::{channel, QueueHandle, QueueReceiver, ReconcileKey, Worker};
pub use reconciler::{Outcome, PodCounts, Reconciler};
pub use store::{ClusterStore, KubeStore, MemoryStore, StoreError};
pub use tokio_util::sync::CancellationToken;
pub use weights::Weights;
