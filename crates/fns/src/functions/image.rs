//! The container/wasm vertex: marshals its filtered input into a resource
//! context, executes it on the per-image worker through the proxy (or a
//! local executable in exec mode), and records the response resources under
//! the declared output variables.

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tracing::{debug, warn};

use weft_engine::{Input, OutputEntry, OutputMap, VertexContext};
use weft_proxy::{ExecuteRequest, ResourceContext};

use crate::fnmap::FnConfig;

use super::local::ExecRunner;

pub async fn run(cfg: &FnConfig, vertex: &VertexContext, input: &Input) -> Result<OutputMap> {
    let filtered = filter_input(&cfg.root_vertex, vertex, input);
    let rctx = build_resource_context(&filtered)?;

    let response = match (&vertex.function.exec, &vertex.function.image) {
        (Some(command), _) => ExecRunner::parse(command, None)?.run(&rctx).await?,
        (None, Some(image)) => {
            let executor = cfg
                .executor
                .as_ref()
                .ok_or_else(|| anyhow!("container vertex {} without an executor", vertex.name))?;
            let resp = executor
                .execute(ExecuteRequest {
                    image: image.clone(),
                    controller: cfg.controller_name.clone(),
                    resource_context: rctx,
                })
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            resp.resource_context
        }
        (None, None) => bail!("container vertex {} declares neither image nor exec", vertex.name),
    };

    record(vertex, response)
}

/// Retain only the variables the vertex declares as inputs, plus the root
/// variable; anything else would leak unrelated state into the worker.
fn filter_input(root_vertex: &str, vertex: &VertexContext, input: &Input) -> Input {
    let mut filtered = Input::new();
    for (var, value) in input.iter() {
        if var == root_vertex || vertex.function.vars.contains_key(var) {
            filtered.add_entry(var.clone(), value.clone());
        }
    }
    filtered
}

/// Flatten the input values (objects, lists of objects, lists of lists) into
/// a resource context.
fn build_resource_context(input: &Input) -> Result<ResourceContext> {
    let mut rctx = ResourceContext::new();
    for (_, value) in input.iter() {
        add_value(&mut rctx, value)?;
    }
    Ok(rctx)
}

fn add_value(rctx: &mut ResourceContext, value: &Value) -> Result<()> {
    match value {
        Value::Object(_) => rctx.add_resource(value.clone()),
        Value::Array(items) => {
            for item in items {
                add_value(rctx, item)?;
            }
            Ok(())
        }
        other => bail!("unexpected resource context input: {}", other),
    }
}

/// Record each returned resource list under the variable its GVK maps to.
/// Unmapped GVKs are dropped with a warning; the worker may emit resources
/// the configuration never declared.
fn record(vertex: &VertexContext, rctx: ResourceContext) -> Result<OutputMap> {
    let mut out = OutputMap::new();
    for (gvk, objects) in rctx.resources {
        let Some(var) = vertex.gvk_to_var.get(&gvk) else {
            warn!(vertex = %vertex.name, gvk = %gvk, "dropping unregistered worker output");
            continue;
        };
        let decl = vertex
            .outputs
            .get(var)
            .ok_or_else(|| anyhow!("unregistered output variable: {}", var))?;
        debug!(vertex = %vertex.name, gvk = %gvk, var = %var, count = objects.len(), "worker output");
        out.insert(
            var.clone(),
            OutputEntry {
                internal: decl.internal,
                conditioned: decl.conditioned,
                gvk: weft_core::parse_gvk_key(&gvk).ok(),
                data: Value::Array(objects),
            },
        );
    }
    Ok(out)
}
