//! The block vertex: owns a nested DAG and runs a fresh engine over it,
//! sharing the outer output and result containers so downstream vertices of
//! the outer DAG observe the block's outputs.

use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_engine::{DagExecutor, ExecKind, OutputMap, VertexContext};

use crate::fnmap::{FnError, FuncMap};
use crate::handler::ExecHandler;

pub async fn run(
    map: Arc<FuncMap>,
    cancel: CancellationToken,
    vertex: &VertexContext,
) -> Result<OutputMap, FnError> {
    let dag = vertex
        .block_dag
        .clone()
        .ok_or_else(|| FnError::Failed(anyhow!("block vertex {} without a nested dag", vertex.name)))?;
    let dag = Arc::new(dag);
    debug!(vertex = %vertex.name, root = dag.root_vertex(), "block run");

    let handler = Arc::new(ExecHandler::new(
        ExecKind::Block,
        dag.clone(),
        map.clone(),
        map.cfg.output.clone(),
        map.cfg.results.clone(),
    ));
    let ok = DagExecutor::new(dag).run(handler, cancel).await;
    if !ok {
        return Err(FnError::Failed(anyhow!("block {} finished with failed vertices", vertex.name)));
    }
    // Block outputs land in the shared containers; the vertex itself adds none.
    Ok(OutputMap::new())
}
