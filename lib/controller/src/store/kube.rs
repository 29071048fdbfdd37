// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes backend for [`ClusterStore`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::Client;

use crate::api::{AppWrapper, NAMESPACE_LABEL, NAME_LABEL};
use crate::store::{ClusterStore, StoreError, StoreResult};
use crate::template::TaggedObject;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn app_wrappers(&self, namespace: &str) -> Api<AppWrapper> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynamic(&self, object: &TaggedObject) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), object.namespace(), &object.resource)
    }
}

/// Map API server errors to store errors by status reason, so callers can
/// tell benign outcomes apart from real failures.
fn map_err(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) => match response.reason.as_str() {
            "NotFound" => StoreError::NotFound,
            "AlreadyExists" => StoreError::AlreadyExists,
            "Conflict" => StoreError::Conflict(response.message),
            _ => StoreError::Api(response.to_string()),
        },
        other => StoreError::Api(other.to_string()),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_app_wrapper(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<AppWrapper>> {
        self.app_wrappers(namespace)
            .get_opt(name)
            .await
            .map_err(map_err)
    }

    async fn list_app_wrappers(&self) -> StoreResult<Vec<AppWrapper>> {
        let api: Api<AppWrapper> = Api::all(self.client.clone());
        Ok(api
            .list(&ListParams::default())
            .await
            .map_err(map_err)?
            .items)
    }

    async fn update_app_wrapper(&self, app_wrapper: &AppWrapper) -> StoreResult<AppWrapper> {
        self.app_wrappers(app_wrapper.namespace())
            .replace(app_wrapper.name(), &PostParams::default(), app_wrapper)
            .await
            .map_err(map_err)
    }

    async fn update_status(&self, app_wrapper: &AppWrapper) -> StoreResult<AppWrapper> {
        let data = serde_json::to_vec(app_wrapper)
            .map_err(|err| StoreError::Api(err.to_string()))?;
        self.app_wrappers(app_wrapper.namespace())
            .replace_status(app_wrapper.name(), &PostParams::default(), data)
            .await
            .map_err(map_err)
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api
            .list(&ListParams::default())
            .await
            .map_err(map_err)?
            .items)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> StoreResult<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        Ok(api.list(&params).await.map_err(map_err)?.items)
    }

    async fn list_owned_pods(&self, namespace: &str, name: &str) -> StoreResult<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default()
            .labels(&format!("{NAMESPACE_LABEL}={namespace},{NAME_LABEL}={name}"));
        Ok(api.list(&params).await.map_err(map_err)?.items)
    }

    async fn create_object(&self, object: &TaggedObject) -> StoreResult<()> {
        self.dynamic(object)
            .create(&PostParams::default(), &object.object)
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn delete_object(&self, object: &TaggedObject) -> StoreResult<()> {
        self.dynamic(object)
            .delete(object.name(), &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(map_err)
    }
}
