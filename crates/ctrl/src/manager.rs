//! The per-document configuration manager.
//!
//! Watches one configuration document and keeps a running stack (image fleet
//! + primary controller) in step with it: created documents start a stack,
//! unchanged touches are ignored, changed data restarts the stack, deletion
//! tears everything down and clears the finalizer. A document that stops
//! parsing never tears down a working stack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::{CONFIG_DATA_KEY, CONFIG_LABEL_KEY, FINALIZER};
use weft_fleet::{DigestResolver, ImageFleet, ImageFleetConfig};
use weft_proxy::FunctionExecutor;
use weft_store::ControllerStore;

use crate::config::{compile, CompiledConfig};
use crate::controller::PrimaryController;
use crate::driver::{ReconcileDriver, ReconcileDriverConfig};

const RETRY: Duration = Duration::from_secs(5);

/// What an observed document state means for the running stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Start,
    Restart,
    Ignore,
}

pub(crate) fn check_action(running_doc: Option<&str>, observed_doc: &str) -> Action {
    match running_doc {
        None => Action::Start,
        Some(current) if current == observed_doc => Action::Ignore,
        Some(_) => Action::Restart,
    }
}

pub struct ConfigManagerConfig {
    pub client: kube::Client,
    pub namespace: String,
    /// Name of the configuration document (and of the controller).
    pub controller_name: String,
    pub store: Arc<ControllerStore>,
    pub resolver: Arc<dyn DigestResolver>,
    pub wrapper_image: String,
    /// Executor handle container vertices call (the function proxy).
    pub executor: Arc<dyn FunctionExecutor>,
    pub concurrency: usize,
    pub requeue_after: Duration,
}

struct RunningStack {
    doc: String,
    fleet: ImageFleet,
    cancel: CancellationToken,
    controller: JoinHandle<()>,
}

pub struct ConfigManager {
    cfg: ConfigManagerConfig,
    stack: Option<RunningStack>,
}

impl ConfigManager {
    pub fn new(cfg: ConfigManagerConfig) -> Self {
        Self { cfg, stack: None }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.cfg.client.clone(), &self.cfg.namespace)
    }

    fn label_value(&self) -> String {
        format!("{}-{}", self.cfg.namespace, self.cfg.controller_name)
    }

    /// Run until cancelled; tears the stack down on the way out.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(controller = %self.cfg.controller_name, "configuration manager starting");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.prepare().await {
                warn!(controller = %self.cfg.controller_name, error = %e, "document not ready");
                tokio::select! {
                    _ = tokio::time::sleep(RETRY) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
            match self.watch(&cancel).await {
                Ok(()) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    // Document deleted; wait for a re-creation.
                }
                Err(e) => {
                    warn!(controller = %self.cfg.controller_name, error = %e, "document watch ended");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY) => {}
                _ = cancel.cancelled() => break,
            }
        }
        self.stop_stack().await;
        info!(controller = %self.cfg.controller_name, "configuration manager stopped");
        Ok(())
    }

    /// Ensure the document exists and carries the watch label and finalizer.
    async fn prepare(&self) -> Result<()> {
        let api = self.api();
        let cm = api
            .get_opt(&self.cfg.controller_name)
            .await?
            .ok_or_else(|| anyhow!("configuration document {} not found", self.cfg.controller_name))?;

        let mut labels = cm.metadata.labels.clone().unwrap_or_default();
        let mut finalizers = cm.metadata.finalizers.clone().unwrap_or_default();
        let labelled = labels.get(CONFIG_LABEL_KEY).map(String::as_str) == Some(&self.label_value()[..]);
        let finalized = finalizers.iter().any(|f| f == FINALIZER);
        if labelled && finalized {
            return Ok(());
        }
        labels.insert(CONFIG_LABEL_KEY.to_string(), self.label_value());
        if !finalized {
            finalizers.push(FINALIZER.to_string());
        }
        let patch = json!({ "metadata": { "labels": labels, "finalizers": finalizers } });
        api.patch(&self.cfg.controller_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("cannot label configuration document")?;
        Ok(())
    }

    /// Watch the labelled document; returns Ok after deletion or
    /// cancellation, Err when the stream fails.
    async fn watch(&mut self, cancel: &CancellationToken) -> Result<()> {
        let selector = format!("{}={}", CONFIG_LABEL_KEY, self.label_value());
        let stream = watcher::watcher(self.api(), watcher::Config::default().labels(&selector));
        futures::pin_mut!(stream);

        loop {
            let event = tokio::select! {
                ev = stream.try_next() => ev.context("document watch failed")?,
                _ = cancel.cancelled() => return Ok(()),
            };
            match event {
                Some(Event::Applied(_)) | Some(Event::Restarted(_)) => {
                    if self.reconcile(cancel).await? {
                        return Ok(());
                    }
                }
                Some(Event::Deleted(_)) => {
                    if self.reconcile(cancel).await? {
                        return Ok(());
                    }
                }
                None => bail!("document watch stream ended"),
            }
        }
    }

    /// One decision-table pass; returns true when the document is gone.
    async fn reconcile(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let Some(cm) = self.api().get_opt(&self.cfg.controller_name).await? else {
            // Nothing left to manage; the finalizer is gone with the object.
            self.stop_stack().await;
            return Ok(true);
        };

        if cm.metadata.deletion_timestamp.is_some() {
            info!(controller = %self.cfg.controller_name, "document deleted; stopping stack");
            self.stop_stack().await;
            self.cfg.store.delete(&self.cfg.controller_name);
            self.clear_finalizer(&cm).await?;
            return Ok(true);
        }

        let Some(doc) = cm.data.as_ref().and_then(|d| d.get(CONFIG_DATA_KEY)).cloned() else {
            warn!(controller = %self.cfg.controller_name, "document has no config key");
            return Ok(false);
        };

        match check_action(self.stack.as_ref().map(|s| s.doc.as_str()), &doc) {
            Action::Ignore => Ok(false),
            action => {
                let compiled = match compile(&doc) {
                    Ok(c) => c,
                    Err(e) => {
                        // Never tear down a working stack over an invalid update.
                        warn!(controller = %self.cfg.controller_name, error = %e,
                              retained = self.stack.is_some(), "configuration does not parse");
                        return Ok(false);
                    }
                };
                if action == Action::Restart {
                    info!(controller = %self.cfg.controller_name, "document changed; restarting stack");
                    self.stop_stack().await;
                }
                self.start_stack(Arc::new(compiled), &cm, doc, cancel).await?;
                Ok(false)
            }
        }
    }

    async fn start_stack(
        &mut self,
        compiled: Arc<CompiledConfig>,
        cm: &ConfigMap,
        doc: String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = &self.cfg.controller_name;
        self.cfg.store.create(name);
        self.cfg.store.set_config(name, doc.clone())?;
        let image_store = self
            .cfg
            .store
            .image_store(name)
            .ok_or_else(|| anyhow!("controller {} missing from store", name))?;

        let owner = cm.metadata.uid.as_ref().map(|uid| {
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "name": cm.metadata.name.clone().unwrap_or_default(),
                "uid": uid,
                "controller": true,
                "blockOwnerDeletion": true,
            })
        });

        let stack_cancel = cancel.child_token();
        let mut fleet = ImageFleet::new(ImageFleetConfig {
            client: self.cfg.client.clone(),
            namespace: self.cfg.namespace.clone(),
            controller_name: name.clone(),
            images: compiled.images.clone(),
            store: image_store,
            resolver: self.cfg.resolver.clone(),
            wrapper_image: self.cfg.wrapper_image.clone(),
            owner,
        });
        fleet.start(&stack_cancel).await?;

        let driver = Arc::new(ReconcileDriver::new(ReconcileDriverConfig {
            client: self.cfg.client.clone(),
            config: compiled.clone(),
            executor: self.cfg.executor.clone(),
            requeue_after: self.cfg.requeue_after,
        }));
        let controller = PrimaryController::new(
            self.cfg.client.clone(),
            compiled,
            driver,
            self.cfg.executor.clone(),
            self.cfg.concurrency,
        );
        let controller_cancel = stack_cancel.clone();
        let controller_task = tokio::spawn(async move {
            if let Err(e) = controller.start(controller_cancel).await {
                warn!(error = %e, "primary controller exited");
            }
        });

        self.stack = Some(RunningStack {
            doc,
            fleet,
            cancel: stack_cancel,
            controller: controller_task,
        });
        Ok(())
    }

    async fn stop_stack(&mut self) {
        if let Some(mut stack) = self.stack.take() {
            stack.cancel.cancel();
            let _ = stack.controller.await;
            stack.fleet.stop().await;
        }
    }

    async fn clear_finalizer(&self, cm: &ConfigMap) -> Result<()> {
        let finalizers: Vec<String> = cm
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        match self
            .api()
            .patch(&self.cfg.controller_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).context("cannot clear document finalizer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table() {
        assert_eq!(check_action(None, "c1"), Action::Start);
        assert_eq!(check_action(Some("c1"), "c1"), Action::Ignore);
        assert_eq!(check_action(Some("c1"), "c2"), Action::Restart);
    }
}
