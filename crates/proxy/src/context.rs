//! Worker protocol payloads.
//!
//! A container/wasm vertex marshals its filtered input into a
//! [`ResourceContext`] — `{"resources": {"<gvk-key>": [rawObject, …]}}` —
//! and the worker answers in the same shape, adding, replacing or annotating
//! resources.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceContext {
    #[serde(default)]
    pub resources: BTreeMap<String, Vec<Value>>,
}

impl ResourceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// File a raw object under its GVK key; the object must carry
    /// apiVersion and kind.
    pub fn add_resource(&mut self, object: Value) -> Result<()> {
        let gvk = weft_core::gvk_of(&object)
            .ok_or_else(|| anyhow!("resource context object without apiVersion/kind: {}", object))?;
        self.resources.entry(weft_core::gvk_key(&gvk)).or_default().push(object);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub image: String,
    pub controller: String,
    #[serde(rename = "resourceContext")]
    pub resource_context: ResourceContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(rename = "resourceContext")]
    pub resource_context: ResourceContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub image: String,
    pub controller: String,
    pub resource: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub resource: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resources_are_keyed_by_gvk() {
        let mut rc = ResourceContext::new();
        rc.add_resource(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}))
            .unwrap();
        rc.add_resource(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}}))
            .unwrap();
        rc.add_resource(json!({"apiVersion": "apps/v1", "kind": "Deployment"})).unwrap();

        assert_eq!(rc.len(), 3);
        assert_eq!(rc.resources["v1/ConfigMap"].len(), 2);
        assert_eq!(rc.resources["apps/v1/Deployment"].len(), 1);
    }

    #[test]
    fn objects_without_identity_are_rejected() {
        let mut rc = ResourceContext::new();
        assert!(rc.add_resource(json!({"metadata": {"name": "x"}})).is_err());
    }

    #[test]
    fn wire_shape_matches_the_protocol() {
        let mut rc = ResourceContext::new();
        rc.add_resource(json!({"apiVersion": "v1", "kind": "ConfigMap"})).unwrap();
        let wire = serde_json::to_value(&ExecuteResponse { resource_context: rc }).unwrap();
        assert!(wire["resourceContext"]["resources"]["v1/ConfigMap"].is_array());
    }
}
