//! Wires one DAG execution together: seeds the root output cell, builds the
//! function map and the handler, and exposes a single `run`.

use std::sync::Arc;

use kube::core::GroupVersionKind;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weft_engine::{DagExecutor, ExecKind, Output, OutputEntry, ResultLog, RuntimeDag};
use weft_proxy::FunctionExecutor;

use crate::fnmap::{FnConfig, FuncMap};
use crate::handler::ExecHandler;

pub struct ExecutionConfig {
    pub controller_name: String,
    /// Execution name, the primary resource's name.
    pub name: String,
    pub namespace: String,
    /// GVK of the root object, recorded on the root output cell.
    pub root_gvk: Option<GroupVersionKind>,
    /// Serialized root object, the seed of the execution.
    pub data: Value,
    pub dag: Arc<RuntimeDag>,
    pub output: Arc<Output>,
    pub results: Arc<ResultLog>,
    /// Cluster client for query vertices.
    pub client: Option<kube::Client>,
    /// Executor handle for container vertices (the function proxy).
    pub executor: Option<Arc<dyn FunctionExecutor>>,
}

pub struct Execution {
    dag: Arc<RuntimeDag>,
    handler: Arc<ExecHandler>,
}

/// Build an execution over a DAG, seeding the root variable with the
/// serialized root object as an internal cell.
pub fn new_execution(cfg: ExecutionConfig) -> Execution {
    let root = cfg.dag.root_vertex().to_string();
    cfg.output.add_entry(
        root.clone(),
        OutputEntry {
            internal: true,
            conditioned: false,
            gvk: cfg.root_gvk.clone(),
            data: cfg.data.clone(),
        },
    );

    let fnmap = FuncMap::new(FnConfig {
        controller_name: cfg.controller_name,
        name: cfg.name,
        namespace: cfg.namespace,
        root_vertex: root,
        client: cfg.client,
        output: cfg.output.clone(),
        results: cfg.results.clone(),
        executor: cfg.executor,
    });

    let handler = Arc::new(ExecHandler::new(
        ExecKind::Root,
        cfg.dag.clone(),
        fnmap,
        cfg.output,
        cfg.results,
    ));

    Execution { dag: cfg.dag, handler }
}

impl Execution {
    /// Run the DAG to quiescence; returns the overall success flag.
    pub async fn run(&self, cancel: CancellationToken) -> bool {
        DagExecutor::new(self.dag.clone()).run(self.handler.clone(), cancel).await
    }
}
