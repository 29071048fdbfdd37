// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wrapped resource templates.
//!
//! Each AppWrapper resource item carries a raw template that is decoded into
//! a dynamic cluster object on demand. Decoding stamps the three owner
//! labels (overwriting whatever the template carried, so pod watches can
//! always attribute events back to the parent) and defaults an empty
//! namespace to the owner's.

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

use crate::api::{AppWrapper, ResourceItem};
use crate::store::{ClusterStore, StoreError};
use crate::{error, Result};

/// A decoded template: the dynamic object plus the API resource needed to
/// address it.
#[derive(Clone, Debug)]
pub struct TaggedObject {
    pub resource: ApiResource,
    pub object: DynamicObject,
}

impl TaggedObject {
    pub fn namespace(&self) -> &str {
        self.object.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        &self.resource.kind
    }
}

/// Deletions still pending after a [`delete_all`] pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeletePending {
    /// Deletions dispatched this pass (the object still existed).
    pub dispatched: usize,
    /// Templates that could not be parsed; logged, never retried in-pass.
    pub unparseable: usize,
}

impl DeletePending {
    pub fn total(&self) -> usize {
        self.dispatched + self.unparseable
    }
}

/// Decode every template of an AppWrapper. Any parse failure fails the
/// whole batch; creation must be all-or-nothing at the parse stage.
pub fn parse_resources(app_wrapper: &AppWrapper) -> Result<Vec<TaggedObject>> {
    app_wrapper
        .spec
        .resources
        .iter()
        .map(|item| parse_resource(app_wrapper, item))
        .collect()
}

/// Decode a single template and stamp ownership on it.
pub fn parse_resource(app_wrapper: &AppWrapper, item: &ResourceItem) -> Result<TaggedObject> {
    let mut object: DynamicObject = serde_json::from_value(item.template.clone())?;

    let types = object
        .types
        .clone()
        .ok_or_else(|| error!("template is missing apiVersion or kind"))?;
    if types.kind.is_empty() {
        return Err(error!("template is missing kind"));
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    if version.is_empty() {
        return Err(error!("template is missing apiVersion"));
    }
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &types.kind));

    if object
        .metadata
        .name
        .as_deref()
        .unwrap_or("")
        .is_empty()
    {
        return Err(error!("template is missing metadata.name"));
    }

    // Wrapped objects are namespaced; an empty namespace means the owner's.
    if object
        .metadata
        .namespace
        .as_deref()
        .unwrap_or("")
        .is_empty()
    {
        object.metadata.namespace = Some(app_wrapper.namespace().to_string());
    }

    // Overwrite, do not merge: ownership labels are authoritative.
    object.metadata.labels = Some(app_wrapper.owner_labels());

    Ok(TaggedObject { resource, object })
}

/// Create every wrapped resource. Creation is effectively idempotent since
/// owner labels key ownership, so "already exists" counts as success.
pub async fn create_all(store: &dyn ClusterStore, objects: &[TaggedObject]) -> Result<()> {
    for object in objects {
        match store.create_object(object).await {
            Ok(()) | Err(StoreError::AlreadyExists) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Request background deletion of every wrapped resource of an AppWrapper.
///
/// "Not found" counts as success. Returns the deletions still pending,
/// distinguishing dispatched deletes from unparseable templates so the
/// caller can decide when to give up on the latter.
pub async fn delete_all(
    store: &dyn ClusterStore,
    app_wrapper: &AppWrapper,
) -> Result<DeletePending> {
    let mut pending = DeletePending::default();
    for item in &app_wrapper.spec.resources {
        let object = match parse_resource(app_wrapper, item) {
            Ok(object) => object,
            Err(err) => {
                tracing::warn!(
                    namespace = app_wrapper.namespace(),
                    name = app_wrapper.name(),
                    error = %err,
                    "template parsing failed during deletion"
                );
                pending.unparseable += 1;
                continue;
            }
        };
        match store.delete_object(&object).await {
            Ok(()) => pending.dispatched += 1,
            Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(pending)
}
