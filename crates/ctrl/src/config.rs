//! Configuration document parsing and compilation.
//!
//! A document declares the primary kind to reconcile, auxiliary kinds to own
//! or watch, the worker images run as services, and per-operation DAG
//! literals. Compilation validates the literals, collects the declared
//! images, and rejects the exec executor for service images.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

use weft_core::{parse_gvk_key, Image};
use weft_engine::{DagError, DagSpec, FunctionKind, RuntimeDag, VertexContext};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot parse configuration document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid gvk key {key}: {reason}")]
    BadKind { key: String, reason: String },
    #[error("invalid {operation} pipeline: {source}")]
    Pipeline {
        operation: String,
        #[source]
        source: DagError,
    },
    #[error("vertex {vertex}: the exec executor is not supported for service image {image}")]
    ExecService { vertex: String, image: String },
    #[error("vertex {vertex} declares both image and exec")]
    AmbiguousExecutor { vertex: String },
}

/// The document as written (YAML under the ConfigMap's config key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub name: String,
    pub spec: ControllerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSpec {
    /// Primary kind, as a gvk key ("group/v1/Kind" or "v1/Kind").
    #[serde(rename = "for")]
    pub for_kind: String,
    #[serde(default)]
    pub own: Vec<String>,
    #[serde(default)]
    pub watch: Vec<String>,
    /// Images that run as long-lived service workers.
    #[serde(default)]
    pub services: Vec<String>,
    pub pipelines: Pipelines,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipelines {
    pub apply: DagSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<DagSpec>,
    /// Per watched-kind apply pipelines, keyed by gvk key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub watch: BTreeMap<String, DagSpec>,
}

/// The compiled execution context of one controller.
#[derive(Debug)]
pub struct CompiledConfig {
    pub name: String,
    pub for_gvk: GroupVersionKind,
    pub own: Vec<GroupVersionKind>,
    pub watch: Vec<GroupVersionKind>,
    pub apply_dag: Arc<RuntimeDag>,
    pub delete_dag: Option<Arc<RuntimeDag>>,
    pub watch_dags: BTreeMap<String, Arc<RuntimeDag>>,
    pub images: Vec<Image>,
}

/// Parse and compile a raw document.
pub fn compile(document: &str) -> Result<CompiledConfig, ConfigError> {
    let config: ControllerConfig = serde_yaml::from_str(document)?;

    let for_gvk = parse_kind(&config.spec.for_kind)?;
    let own = config.spec.own.iter().map(|k| parse_kind(k)).collect::<Result<_, _>>()?;
    let watch = config.spec.watch.iter().map(|k| parse_kind(k)).collect::<Result<_, _>>()?;

    let apply_dag = compile_dag("apply", config.spec.pipelines.apply)?;
    let delete_dag = config
        .spec
        .pipelines
        .delete
        .map(|spec| compile_dag("delete", spec))
        .transpose()?;
    let mut watch_dags = BTreeMap::new();
    for (key, spec) in config.spec.pipelines.watch {
        parse_kind(&key)?;
        let dag = compile_dag(&format!("watch {key}"), spec)?;
        watch_dags.insert(key, dag);
    }

    let mut images = Vec::new();
    let mut dags: Vec<&RuntimeDag> = vec![&apply_dag];
    if let Some(d) = &delete_dag {
        dags.push(d);
    }
    dags.extend(watch_dags.values().map(Arc::as_ref));
    for dag in dags {
        collect_images(dag, &config.spec.services, &mut images)?;
    }
    images.sort_by(|a, b| (&a.name, a.kind as u8).cmp(&(&b.name, b.kind as u8)));
    images.dedup();

    Ok(CompiledConfig {
        name: config.name,
        for_gvk,
        own,
        watch,
        apply_dag,
        delete_dag,
        watch_dags,
        images,
    })
}

fn parse_kind(key: &str) -> Result<GroupVersionKind, ConfigError> {
    parse_gvk_key(key).map_err(|e| ConfigError::BadKind { key: key.to_string(), reason: e.to_string() })
}

fn compile_dag(operation: &str, spec: DagSpec) -> Result<Arc<RuntimeDag>, ConfigError> {
    RuntimeDag::from_spec(spec)
        .map(Arc::new)
        .map_err(|source| ConfigError::Pipeline { operation: operation.to_string(), source })
}

/// Walk every vertex (nested blocks included) collecting declared images.
fn collect_images(
    dag: &RuntimeDag,
    services: &[String],
    out: &mut Vec<Image>,
) -> Result<(), ConfigError> {
    for vertex in dag.vertices().values() {
        collect_vertex(vertex, services, out)?;
        if let Some(block) = &vertex.block_dag {
            collect_images(block, services, out)?;
        }
    }
    Ok(())
}

fn collect_vertex(
    vertex: &VertexContext,
    services: &[String],
    out: &mut Vec<Image>,
) -> Result<(), ConfigError> {
    if !matches!(vertex.function.kind, FunctionKind::Container | FunctionKind::Wasm) {
        return Ok(());
    }
    match (&vertex.function.image, &vertex.function.exec) {
        (Some(image), Some(_)) if services.contains(image) => {
            return Err(ConfigError::ExecService {
                vertex: vertex.name.clone(),
                image: image.clone(),
            });
        }
        (Some(_), Some(_)) => {
            return Err(ConfigError::AmbiguousExecutor { vertex: vertex.name.clone() });
        }
        (Some(image), None) => {
            let img = if services.contains(image) {
                Image::service(image.clone())
            } else {
                Image::function(image.clone())
            };
            out.push(img);
        }
        (None, _) => {}
    }
    Ok(())
}
