//! Typed dispatch by vertex function kind.
//!
//! A closed match hands each vertex to its runner; every runner receives only
//! the dependencies it uses (the query runner gets the cluster client, the
//! container runner gets the executor handle, the block runner gets the map
//! itself for recursion).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_engine::{FunctionKind, Input, Output, OutputMap, ResultLog, VertexContext};
use weft_proxy::FunctionExecutor;

use crate::functions;

/// Vertex run outcome distinct from success: a false condition is a semantic
/// skip, not an error.
#[derive(Debug, thiserror::Error)]
pub enum FnError {
    #[error("condition evaluated to false")]
    ConditionFalse,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Dependencies shared by the function map; each runner picks what it needs.
pub struct FnConfig {
    pub controller_name: String,
    /// Execution name (the primary resource's name).
    pub name: String,
    pub namespace: String,
    pub root_vertex: String,
    /// Cluster client for query vertices.
    pub client: Option<kube::Client>,
    /// Shared execution output; block runs thread it through.
    pub output: Arc<Output>,
    /// Shared result log; block runs thread it through.
    pub results: Arc<ResultLog>,
    /// Executor handle for container/wasm vertices (the function proxy).
    pub executor: Option<Arc<dyn FunctionExecutor>>,
}

pub struct FuncMap {
    pub(crate) cfg: FnConfig,
}

impl FuncMap {
    pub fn new(cfg: FnConfig) -> Arc<Self> {
        Arc::new(Self { cfg })
    }

    /// Run one vertex function against its assembled input.
    pub async fn run(
        map: Arc<Self>,
        cancel: CancellationToken,
        vertex: &VertexContext,
        input: &Input,
    ) -> Result<OutputMap, FnError> {
        debug!(vertex = %vertex.name, kind = vertex.function.kind.as_str(), "function dispatch");

        // A false condition skips the whole vertex regardless of kind.
        if let Some(cond) = &vertex.function.condition {
            if !functions::jq::eval_condition(cond, input)? {
                return Err(FnError::ConditionFalse);
            }
        }

        match vertex.function.kind {
            FunctionKind::Root => Ok(OutputMap::new()),
            FunctionKind::Block => functions::block::run(map, cancel, vertex).await,
            FunctionKind::Slice | FunctionKind::Map => {
                functions::structural::run(vertex, input).map_err(FnError::from)
            }
            FunctionKind::Query => {
                let client = map.cfg.client.clone().ok_or_else(|| {
                    FnError::from(anyhow::anyhow!("query vertex without a cluster client"))
                })?;
                functions::query::run(&client, vertex).await.map_err(FnError::from)
            }
            FunctionKind::Template => functions::template::run(vertex, input).map_err(FnError::from),
            FunctionKind::Jq => functions::jq::run_vertex(vertex, input).map_err(FnError::from),
            FunctionKind::Container | FunctionKind::Wasm => {
                functions::image::run(&map.cfg, vertex, input).await.map_err(FnError::from)
            }
        }
    }
}
