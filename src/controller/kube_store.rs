//! [`ObjectStore`] backed by the Kubernetes API server

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::store::{ObjectKey, ObjectStore, WatchEvent};
use crate::error::StoreError;

/// Dynamic-object access to the cluster through a kube [`Client`]
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let api = self.api(ar, key.namespace.as_deref());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.api(ar, namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let api = self.api(ar, obj.namespace().as_deref());
        Ok(api.create(&self.post_params(), obj).await?)
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let api = self.api(ar, obj.namespace().as_deref());
        Ok(api
            .replace(&obj.name_any(), &self.post_params(), obj)
            .await?)
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), StoreError> {
        let api = self.api(ar, key.namespace.as_deref());
        api.delete(&key.name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, StoreError> {
        let api = self.api(ar, key.namespace.as_deref());
        let patch = serde_json::json!({ "status": status });
        Ok(api
            .patch_status(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?)
    }

    fn watch(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent, StoreError>> {
        let api = self.api(ar, namespace);
        let kind = ar.kind.clone();
        let mut config = watcher::Config::default();
        if let Some(selector) = label_selector {
            config = config.labels(selector);
        }
        watcher(api, config)
            .default_backoff()
            .filter_map(move |event| {
                let mapped = match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::Applied(obj)))
                    }
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Ok(watcher::Event::Init) => {
                        debug!("Watch for {} (re)started", kind);
                        Some(Ok(WatchEvent::Restarted))
                    }
                    Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(StoreError::Transient(e.to_string()))),
                };
                futures::future::ready(mapped)
            })
            .boxed()
    }
}
