//! The execution handler: assembles each vertex's input from its
//! predecessors' outputs, dispatches through the function map, merges the
//! produced cells and records the result entry.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use weft_engine::{
    ExecKind, FunctionKind, Input, Output, ResultEntry, ResultLog, RuntimeDag, VertexContext,
    VertexHandler,
};

use crate::fnmap::{FnError, FuncMap};

pub struct ExecHandler {
    exec_kind: ExecKind,
    dag: Arc<RuntimeDag>,
    fnmap: Arc<FuncMap>,
    output: Arc<Output>,
    results: Arc<ResultLog>,
}

impl ExecHandler {
    pub fn new(
        exec_kind: ExecKind,
        dag: Arc<RuntimeDag>,
        fnmap: Arc<FuncMap>,
        output: Arc<Output>,
        results: Arc<ResultLog>,
    ) -> Self {
        Self { exec_kind, dag, fnmap, output, results }
    }

    /// Gather the input for one vertex. Container-backed vertices always see
    /// the root variable in addition to their references; everything else
    /// sees its references only.
    fn assemble_input(&self, vertex: &VertexContext) -> Input {
        let root = self.dag.root_vertex();
        let mut input = Input::new();
        match vertex.function.kind {
            FunctionKind::Root => {}
            FunctionKind::Container | FunctionKind::Wasm => {
                input.add_entry(root, self.output.data(root));
                for reference in &vertex.references {
                    input.add_entry(reference.clone(), self.output.data(reference));
                }
            }
            _ => {
                for reference in &vertex.references {
                    input.add_entry(reference.clone(), self.output.data(reference));
                }
            }
        }
        input
    }
}

#[async_trait]
impl VertexHandler for ExecHandler {
    async fn run_vertex(&self, cancel: CancellationToken, vertex: VertexContext) -> bool {
        let start = Instant::now();
        let input = self.assemble_input(&vertex);

        let run = FuncMap::run(self.fnmap.clone(), cancel, &vertex, &input).await;
        let (success, reason, produced) = match run {
            Ok(out) => (true, String::new(), Some(out)),
            Err(FnError::ConditionFalse) => (true, "condition false".to_string(), None),
            Err(FnError::Failed(e)) => {
                warn!(vertex = %vertex.name, error = %e, "vertex run failed");
                (false, format!("{e:#}"), None)
            }
        };

        if let Some(cells) = &produced {
            self.output.merge(cells.clone());
        }
        self.results.add(ResultEntry {
            exec_kind: self.exec_kind,
            exec_name: self.dag.root_vertex().to_string(),
            vertex_name: vertex.name.clone(),
            start,
            end: Instant::now(),
            input: Some(input),
            output: produced,
            success,
            reason,
        });
        success
    }

    fn post_run(&self, start: Instant, finish: Instant, success: bool) {
        self.results.add(ResultEntry {
            exec_kind: self.exec_kind,
            exec_name: self.dag.root_vertex().to_string(),
            vertex_name: weft_engine::result::TOTAL_VERTEX.to_string(),
            start,
            end: finish,
            input: None,
            output: None,
            success,
            reason: String::new(),
        });
    }
}
