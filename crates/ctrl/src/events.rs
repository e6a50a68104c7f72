//! Watch-kind event handling: every event of an owned/watched kind runs the
//! kind's pipeline as a one-shot execution.

use std::sync::Arc;

use anyhow::{Context, Result};
use kube::core::{DynamicObject, GroupVersionKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_engine::{Output, ResultLog, RuntimeDag};
use weft_fns::{new_execution, ExecutionConfig};
use weft_proxy::FunctionExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Generic,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Generic => "generic",
        }
    }
}

/// One handler per watched kind; events run synchronously on the watch task,
/// the external watch plumbing provides the rate limiting.
pub struct WatchEventHandler {
    pub controller_name: String,
    pub gvk: GroupVersionKind,
    pub dag: Arc<RuntimeDag>,
    pub client: kube::Client,
    pub executor: Arc<dyn FunctionExecutor>,
}

impl WatchEventHandler {
    pub async fn handle(&self, kind: EventKind, obj: &DynamicObject) {
        let name = obj.metadata.name.clone().unwrap_or_default();
        info!(event = kind.as_str(), gvk = %weft_core::gvk_key(&self.gvk), name = %name, "watch event");
        if let Err(e) = self.run(obj).await {
            warn!(event = kind.as_str(), name = %name, error = %e, "watch pipeline failed");
        }
    }

    async fn run(&self, obj: &DynamicObject) -> Result<()> {
        let data = serde_json::to_value(obj).context("serializing watched object")?;
        let namespace = obj
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let output = Arc::new(Output::new());
        let results = Arc::new(ResultLog::new());
        let execution = new_execution(ExecutionConfig {
            controller_name: self.controller_name.clone(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            namespace,
            root_gvk: Some(self.gvk.clone()),
            data,
            dag: self.dag.clone(),
            output,
            results: results.clone(),
            client: Some(self.client.clone()),
            executor: Some(self.executor.clone()),
        });
        execution.run(CancellationToken::new()).await;
        results.print();
        Ok(())
    }
}
