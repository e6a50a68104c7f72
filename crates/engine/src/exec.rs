//! Parallel topological executor.
//!
//! Guarantees, for every run:
//! - a vertex handler starts only after every predecessor's handler returned;
//! - vertices with no path between them may run concurrently;
//! - a failed predecessor never prevents a successor from running — the
//!   outcome only flows into the result log;
//! - cancelling the token stops new handler invocations, lets in-flight
//!   handlers finish, then returns;
//! - `post_run` fires exactly once with (start, finish, overall success).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dag::{RuntimeDag, VertexContext};

/// Per-vertex execution hook pair handed to the executor at run time.
#[async_trait]
pub trait VertexHandler: Send + Sync {
    /// Run one vertex; the returned flag feeds the overall success
    /// conjunction and the result log, nothing else.
    async fn run_vertex(&self, cancel: CancellationToken, vertex: VertexContext) -> bool;

    /// Called exactly once after every scheduled vertex finished.
    fn post_run(&self, start: Instant, finish: Instant, success: bool);
}

/// Executes a [`RuntimeDag`] with maximum parallelism.
pub struct DagExecutor {
    dag: Arc<RuntimeDag>,
}

impl DagExecutor {
    pub fn new(dag: Arc<RuntimeDag>) -> Self {
        Self { dag }
    }

    /// Run every reachable vertex once; returns the overall success flag.
    pub async fn run(&self, handler: Arc<dyn VertexHandler>, cancel: CancellationToken) -> bool {
        let start = Instant::now();
        let successors = self.dag.successors();
        let mut remaining = self.dag.predecessor_counts();
        let mut tasks: JoinSet<(String, bool)> = JoinSet::new();
        let mut overall = true;

        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(n, _)| n.clone())
            .collect();
        for name in ready {
            if cancel.is_cancelled() {
                break;
            }
            self.spawn(&mut tasks, handler.clone(), cancel.clone(), name);
        }

        while let Some(joined) = tasks.join_next().await {
            let name = match joined {
                Ok((name, ok)) => {
                    if !ok {
                        overall = false;
                    }
                    name
                }
                Err(e) => {
                    // A panicking handler counts as a failed execution; the
                    // vertex name is lost, so its successors never schedule.
                    warn!(error = %e, "vertex task aborted");
                    overall = false;
                    continue;
                }
            };
            for succ in &successors[&name] {
                let count = remaining.get_mut(succ).expect("validated vertex");
                *count -= 1;
                if *count == 0 {
                    if cancel.is_cancelled() {
                        debug!(vertex = %succ, "skipping vertex after cancellation");
                        continue;
                    }
                    self.spawn(&mut tasks, handler.clone(), cancel.clone(), succ.clone());
                }
            }
        }

        let finish = Instant::now();
        histogram!("engine_exec_ms", finish.duration_since(start).as_secs_f64() * 1000.0);
        handler.post_run(start, finish, overall);
        overall
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<(String, bool)>,
        handler: Arc<dyn VertexHandler>,
        cancel: CancellationToken,
        name: String,
    ) {
        let vertex = self
            .dag
            .vertex(&name)
            .expect("scheduled vertex exists")
            .clone();
        counter!("engine_vertex_runs_total", 1u64);
        tasks.spawn(async move {
            debug!(vertex = %name, kind = vertex.function.kind.as_str(), "vertex start");
            let ok = handler.run_vertex(cancel, vertex).await;
            debug!(vertex = %name, success = ok, "vertex done");
            (name, ok)
        });
    }
}
