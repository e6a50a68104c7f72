//! The per-controller image fleet: one image controller per declared image.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use weft_core::{worker_pod_name, Image};
use weft_store::ImageStore;

use crate::controller::{ImageController, ImageControllerConfig};
use crate::resolve::DigestResolver;

pub struct ImageFleetConfig {
    pub client: kube::Client,
    pub namespace: String,
    pub controller_name: String,
    pub images: Vec<Image>,
    pub store: Arc<ImageStore>,
    pub resolver: Arc<dyn DigestResolver>,
    pub wrapper_image: String,
    /// Owner reference to the configuration document.
    pub owner: Option<Value>,
}

pub struct ImageFleet {
    cfg: ImageFleetConfig,
    cancel: Option<CancellationToken>,
    controllers: Vec<Arc<ImageController>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ImageFleet {
    pub fn new(cfg: ImageFleetConfig) -> Self {
        Self { cfg, cancel: None, controllers: Vec::new(), tasks: Vec::new() }
    }

    /// Resolve digests, derive pod names, and launch one controller per
    /// image under a child token of `parent`.
    pub async fn start(&mut self, parent: &CancellationToken) -> Result<()> {
        let cancel = parent.child_token();
        for image in &self.cfg.images {
            self.cfg.store.create(image.clone());

            let de = self
                .cfg
                .resolver
                .resolve(&image.name)
                .await
                .with_context(|| format!("cannot resolve image {}", image.name))?;
            let pod_name = worker_pod_name(&self.cfg.controller_name, &image.name, &de.digest)?;

            let controller = Arc::new(ImageController::new(ImageControllerConfig {
                client: self.cfg.client.clone(),
                namespace: self.cfg.namespace.clone(),
                image: image.clone(),
                pod_name,
                de,
                wrapper_image: self.cfg.wrapper_image.clone(),
                owner: self.cfg.owner.clone(),
                store: self.cfg.store.clone(),
            }));
            let task = {
                let controller = controller.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { controller.start(cancel).await })
            };
            self.controllers.push(controller);
            self.tasks.push(task);
        }
        info!(controller = %self.cfg.controller_name, images = self.cfg.images.len(), "image fleet started");
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Cancel the controllers, wait them out, then tear the workloads down.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        for controller in self.controllers.drain(..) {
            controller.stop().await;
        }
        info!(controller = %self.cfg.controller_name, "image fleet stopped");
    }
}
