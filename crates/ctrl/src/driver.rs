//! The reconcile driver: runs the apply or delete pipeline for one primary
//! object and writes the produced artifacts back to the cluster.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_engine::{Output, ResultLog};
use weft_fns::{new_execution, ExecutionConfig};
use weft_proxy::FunctionExecutor;

use crate::applicator::Applicator;
use crate::config::CompiledConfig;

#[derive(Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    Requeue(Duration),
}

pub struct ReconcileDriverConfig {
    pub client: kube::Client,
    pub config: Arc<CompiledConfig>,
    /// Executor handle container vertices call (the function proxy).
    pub executor: Arc<dyn FunctionExecutor>,
    /// Delay before a failed reconcile is retried.
    pub requeue_after: Duration,
}

pub struct ReconcileDriver {
    cfg: ReconcileDriverConfig,
    applicator: Applicator,
}

impl ReconcileDriver {
    pub fn new(cfg: ReconcileDriverConfig) -> Self {
        let applicator = Applicator::new(cfg.client.clone());
        Self { cfg, applicator }
    }

    /// Reconcile one `(namespace, name)` key of the primary kind.
    pub async fn reconcile(
        &self,
        cancel: CancellationToken,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ReconcileOutcome> {
        let gvk = &self.cfg.config.for_gvk;
        counter!("reconcile_runs_total", 1u64);

        // Already removed: nothing left to do.
        let Some(obj) = self.applicator.get(gvk, namespace, name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        let obj = self.applicator.ensure_finalizer(gvk, &obj).await?;
        let data = serde_json::to_value(&obj).context("serializing primary object")?;
        let deleting = obj.metadata.deletion_timestamp.is_some();

        if deleting {
            info!(name, ns = namespace.unwrap_or("-"), "reconcile delete started");
            if let Some(delete_dag) = &self.cfg.config.delete_dag {
                let (ok, _output) = self
                    .run_pipeline(cancel, delete_dag.clone(), namespace, name, data)
                    .await;
                if !ok {
                    counter!("reconcile_failures_total", 1u64, "branch" => "delete");
                    return Ok(ReconcileOutcome::Requeue(self.cfg.requeue_after));
                }
            }
            self.applicator.remove_finalizer(gvk, &obj).await?;
            info!(name, "reconcile delete finished");
            return Ok(ReconcileOutcome::Done);
        }

        info!(name, ns = namespace.unwrap_or("-"), "reconcile apply started");
        let (ok, output) = self
            .run_pipeline(cancel, self.cfg.config.apply_dag.clone(), namespace, name, data.clone())
            .await;
        if !ok {
            counter!("reconcile_failures_total", 1u64, "branch" => "apply");
            return Ok(ReconcileOutcome::Requeue(self.cfg.requeue_after));
        }

        // An artifact of the primary kind replaces the in-memory object;
        // everything else is server-side-applied as its own object.
        let for_key = weft_core::gvk_key(gvk);
        let mut primary = data;
        for artifact in output.final_output() {
            let is_primary = weft_core::gvk_of(&artifact)
                .map(|g| weft_core::gvk_key(&g) == for_key)
                .unwrap_or(false);
            if is_primary {
                primary = artifact;
                continue;
            }
            if let Err(e) = self.applicator.apply(&artifact).await {
                warn!(error = %e, "cannot write artifact");
                counter!("reconcile_failures_total", 1u64, "branch" => "write");
                return Ok(ReconcileOutcome::Requeue(self.cfg.requeue_after));
            }
        }

        // The primary object's status goes through the status subresource;
        // a plain apply would silently drop it.
        if let Err(e) = self
            .applicator
            .update_status(gvk, namespace, name, &primary)
            .await
        {
            warn!(error = %e, "cannot update primary status");
            counter!("reconcile_failures_total", 1u64, "branch" => "status");
            return Ok(ReconcileOutcome::Requeue(self.cfg.requeue_after));
        }
        info!(name, "reconcile apply finished");
        Ok(ReconcileOutcome::Done)
    }

    async fn run_pipeline(
        &self,
        cancel: CancellationToken,
        dag: Arc<weft_engine::RuntimeDag>,
        namespace: Option<&str>,
        name: &str,
        data: Value,
    ) -> (bool, Arc<Output>) {
        let output = Arc::new(Output::new());
        let results = Arc::new(ResultLog::new());
        let execution = new_execution(ExecutionConfig {
            controller_name: self.cfg.config.name.clone(),
            name: name.to_string(),
            namespace: namespace.unwrap_or("default").to_string(),
            root_gvk: Some(self.cfg.config.for_gvk.clone()),
            data,
            dag,
            output: output.clone(),
            results: results.clone(),
            client: Some(self.cfg.client.clone()),
            executor: Some(self.cfg.executor.clone()),
        });
        let ok = execution.run(cancel).await;
        results.print();
        (ok, output)
    }
}
