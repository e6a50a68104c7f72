//! The query vertex: reads a list of the configured kind from the cluster,
//! optionally filtered by label selector, and records the items as plain
//! maps.

use anyhow::{anyhow, Context, Result};
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject};
use serde_json::Value;
use tracing::debug;

use weft_engine::{OutputMap, VertexContext};

use super::fill_outputs;

pub async fn run(client: &kube::Client, vertex: &VertexContext) -> Result<OutputMap> {
    let resource = vertex
        .function
        .resource
        .as_ref()
        .ok_or_else(|| anyhow!("query vertex {} without a resource", vertex.name))?;
    let gvk = weft_core::gvk_of(resource)
        .ok_or_else(|| anyhow!("query vertex {} resource without apiVersion/kind", vertex.name))?;
    debug!(vertex = %vertex.name, gvk = %weft_core::gvk_key(&gvk), "query");

    let ar = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);

    let mut params = ListParams::default();
    if let Some(selector) = &vertex.function.selector {
        params = params.labels(&selector_string(selector));
    }

    let list = api
        .list(&params)
        .await
        .with_context(|| format!("cannot list {}", weft_core::gvk_key(&gvk)))?;

    let mut items = Vec::with_capacity(list.items.len());
    for obj in &list.items {
        let mut raw = serde_json::to_value(obj).context("serializing listed object")?;
        strip_managed_fields(&mut raw);
        items.push(raw);
    }
    Ok(fill_outputs(vertex, Value::Array(items)))
}

pub(crate) fn selector_string(selector: &std::collections::BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_renders_as_label_list() {
        let sel = [("app".to_string(), "x".to_string()), ("tier".to_string(), "db".to_string())]
            .into_iter()
            .collect();
        assert_eq!(selector_string(&sel), "app=x,tier=db");
    }

    #[test]
    fn managed_fields_are_stripped() {
        let mut v = json!({"metadata": {"name": "a", "managedFields": [{}]}});
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "a");
    }
}
