//! Dynamic-object access: server-side apply with a stable field manager,
//! finalizer handling, and not-found tolerant reads.

use anyhow::{anyhow, Context, Result};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{json, Value};
use tracing::debug;

use weft_core::FINALIZER;

/// Field manager for everything the reconcile driver applies.
pub const FIELD_MANAGER: &str = "weft-controller";

#[derive(Clone)]
pub struct Applicator {
    client: kube::Client,
}

impl Applicator {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource::from_gvk(gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    pub async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(gvk, namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("cannot get {}/{}", weft_core::gvk_key(gvk), name))
    }

    /// Server-side apply of a raw artifact; identity comes from the document.
    pub async fn apply(&self, artifact: &Value) -> Result<DynamicObject> {
        let gvk = weft_core::gvk_of(artifact)
            .ok_or_else(|| anyhow!("artifact without apiVersion/kind: {}", artifact))?;
        let name = artifact
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("artifact without metadata.name: {}", artifact))?;
        let namespace = artifact.pointer("/metadata/namespace").and_then(Value::as_str);
        debug!(gvk = %weft_core::gvk_key(&gvk), name, "server-side apply");

        self.api(&gvk, namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(artifact))
            .await
            .with_context(|| format!("server-side apply failed for {}/{}", weft_core::gvk_key(&gvk), name))
    }

    /// Persist an object's `.status` through the status subresource.
    ///
    /// The API server ignores `.status` writes on the main endpoint once the
    /// kind has a status subresource, so the primary object's status must go
    /// through this path. Objects without a status field are left alone.
    pub async fn update_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        obj: &Value,
    ) -> Result<()> {
        let Some(status) = obj.get("status") else {
            return Ok(());
        };
        debug!(gvk = %weft_core::gvk_key(gvk), name, "status update");
        let patch = json!({ "status": status });
        self.api(gvk, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| {
                format!("cannot update status of {}/{}", weft_core::gvk_key(gvk), name)
            })?;
        Ok(())
    }

    pub async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        match self.api(gvk, namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("cannot delete {}/{}", weft_core::gvk_key(gvk), name)),
        }
    }

    /// Add the finalizer if missing, persisting the object.
    pub async fn ensure_finalizer(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut finalizers = obj.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(obj.clone());
        }
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(gvk, obj, finalizers).await
    }

    /// Remove the finalizer, persisting the object.
    pub async fn remove_finalizer(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let finalizers: Vec<String> = obj
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect();
        self.patch_finalizers(gvk, obj, finalizers).await
    }

    async fn patch_finalizers(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
        finalizers: Vec<String>,
    ) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("object without metadata.name"))?;
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.api(gvk, obj.metadata.namespace.as_deref())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("cannot update finalizers on {}/{}", weft_core::gvk_key(gvk), name))
    }
}
