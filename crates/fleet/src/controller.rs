//! Per-(controller, image) worker controller.
//!
//! Runs an apply loop (server-side apply of pod + service, then observe
//! phase/readiness and publish or retract the store client) and a watch loop
//! that re-runs the apply on any labelled pod/service event. Stream failures
//! back off ~5 s and reconcile from scratch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use metrics::counter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::{DigestAndEntrypoint, Image, WORKER_LABEL_KEY};
use weft_store::ImageStore;

use crate::workload::{self, FIELD_MANAGER};

const BACKOFF: Duration = Duration::from_secs(5);

pub struct ImageControllerConfig {
    pub client: kube::Client,
    pub namespace: String,
    pub image: Image,
    pub pod_name: String,
    pub de: DigestAndEntrypoint,
    pub wrapper_image: String,
    /// Owner reference to the configuration document, for cascaded cleanup.
    pub owner: Option<Value>,
    pub store: Arc<ImageStore>,
}

pub struct ImageController {
    cfg: ImageControllerConfig,
}

/// What the observed pod state means for the published client.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClientAction {
    Publish(String),
    Retract,
}

/// The readiness state machine: publish only on Running + Ready.
pub(crate) fn client_action(pod: &Pod) -> ClientAction {
    let status = pod.status.as_ref();
    if status.and_then(|s| s.phase.as_deref()) != Some("Running") {
        return ClientAction::Retract;
    }
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    if ready {
        let ip = status.and_then(|s| s.pod_ip.clone()).unwrap_or_default();
        ClientAction::Publish(ip)
    } else {
        ClientAction::Retract
    }
}

impl ImageController {
    pub fn new(cfg: ImageControllerConfig) -> Self {
        Self { cfg }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.cfg.client.clone(), &self.cfg.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.cfg.client.clone(), &self.cfg.namespace)
    }

    /// Run until the token is cancelled.
    pub async fn start(&self, cancel: CancellationToken) {
        info!(image = %self.cfg.image, pod = %self.cfg.pod_name, "image controller starting");
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.reconcile().await {
                warn!(image = %self.cfg.image, error = %e, "apply failed; backing off");
                self.cfg.store.delete_client(&self.cfg.image);
                tokio::select! {
                    _ = tokio::time::sleep(BACKOFF) => continue,
                    _ = cancel.cancelled() => return,
                }
            }
            match self.watch(&cancel).await {
                Ok(()) => return, // cancelled
                Err(e) => {
                    warn!(image = %self.cfg.image, error = %e, "watch ended; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(BACKOFF) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// One apply pass: pod and service server-side apply, then observe.
    async fn reconcile(&self) -> Result<()> {
        counter!("imagectrl_apply_total", 1u64);
        let pp = PatchParams::apply(FIELD_MANAGER);
        let pod_doc = workload::pod(
            &self.cfg.image,
            &self.cfg.pod_name,
            &self.cfg.namespace,
            &self.cfg.de,
            &self.cfg.wrapper_image,
            self.cfg.owner.as_ref(),
        );
        self.pods()
            .patch(&self.cfg.pod_name, &pp, &Patch::Apply(&pod_doc))
            .await
            .context("cannot apply worker pod")?;

        let svc_doc = workload::service(&self.cfg.pod_name, &self.cfg.namespace, self.cfg.owner.as_ref());
        self.services()
            .patch(&self.cfg.pod_name, &pp, &Patch::Apply(&svc_doc))
            .await
            .context("cannot apply worker service")?;

        let observed = self
            .pods()
            .get_opt(&self.cfg.pod_name)
            .await
            .context("cannot observe worker pod")?;
        match observed.as_ref().map(client_action) {
            Some(ClientAction::Publish(ip)) => {
                self.cfg
                    .store
                    .set_client(&self.cfg.image, &self.cfg.pod_name, &ip)
                    .context("cannot publish worker client")?;
            }
            Some(ClientAction::Retract) | None => self.cfg.store.delete_client(&self.cfg.image),
        }
        Ok(())
    }

    /// Re-run the apply pass on every labelled pod/service event. Returns
    /// Ok(()) on cancellation, Err when either stream ends or fails.
    async fn watch(&self, cancel: &CancellationToken) -> Result<()> {
        let selector = format!("{}={}", WORKER_LABEL_KEY, self.cfg.pod_name);
        let cfg = watcher::Config::default().labels(&selector);
        let pod_stream = watcher::watcher(self.pods(), cfg.clone());
        let svc_stream = watcher::watcher(self.services(), cfg);
        futures::pin_mut!(pod_stream);
        futures::pin_mut!(svc_stream);

        debug!(image = %self.cfg.image, selector = %selector, "watch loop open");
        loop {
            let event: Option<&'static str> = tokio::select! {
                ev = pod_stream.try_next() => match ev.context("pod watch failed")? {
                    Some(Event::Applied(_)) | Some(Event::Deleted(_)) | Some(Event::Restarted(_)) => Some("pod"),
                    None => anyhow::bail!("pod watch stream ended"),
                },
                ev = svc_stream.try_next() => match ev.context("service watch failed")? {
                    Some(Event::Applied(_)) | Some(Event::Deleted(_)) | Some(Event::Restarted(_)) => Some("service"),
                    None => anyhow::bail!("service watch stream ended"),
                },
                _ = cancel.cancelled() => return Ok(()),
            };
            if let Some(kind) = event {
                counter!("imagectrl_watch_events_total", 1u64, "kind" => kind);
                if let Err(e) = self.reconcile().await {
                    warn!(image = %self.cfg.image, error = %e, "apply after watch event failed");
                }
            }
        }
    }

    /// Delete pod and service by their deterministic names. Cascade via
    /// owner references covers the unclean path.
    pub async fn stop(&self) {
        self.cfg.store.delete_client(&self.cfg.image);
        for result in [
            self.pods().delete(&self.cfg.pod_name, &DeleteParams::default()).await.map(|_| ()),
            self.services().delete(&self.cfg.pod_name, &DeleteParams::default()).await.map(|_| ()),
        ] {
            match result {
                Ok(()) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => warn!(image = %self.cfg.image, error = %e, "worker teardown failed"),
            }
        }
        info!(image = %self.cfg.image, pod = %self.cfg.pod_name, "image controller stopped");
    }
}
