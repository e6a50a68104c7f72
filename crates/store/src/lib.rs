//! Weft controller/image registry.
//!
//! Process-wide, two-level mapping: controller name → image → worker client
//! handles. The image controller publishes a client when it observes a ready
//! endpoint and retracts it on any non-ready transition; everything else only
//! reads. Presence of a client implies the endpoint is considered ready.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use tracing::debug;

use weft_core::{Image, ImageKind, WORKER_GRPC_PORT};
use weft_proxy::{ClientLookup, FnClient, SvcClient, WorkerConnector};

#[derive(Default)]
struct ImageEntry {
    fn_client: Option<FnClient>,
    svc_client: Option<SvcClient>,
}

/// Per-controller image → client registry. Readers share, writers exclude.
pub struct ImageStore {
    namespace: String,
    connector: Arc<dyn WorkerConnector>,
    entries: RwLock<HashMap<Image, ImageEntry>>,
}

impl ImageStore {
    pub fn new(namespace: impl Into<String>, connector: Arc<dyn WorkerConnector>) -> Self {
        Self {
            namespace: namespace.into(),
            connector,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn list(&self) -> Vec<Image> {
        self.entries.read().expect("image store lock").keys().cloned().collect()
    }

    pub fn exists(&self, image: &Image) -> bool {
        self.entries.read().expect("image store lock").contains_key(image)
    }

    /// Idempotent: re-creating an existing entry keeps its clients.
    pub fn create(&self, image: Image) {
        self.entries
            .write()
            .expect("image store lock")
            .entry(image)
            .or_default();
    }

    pub fn delete(&self, image: &Image) {
        self.entries.write().expect("image store lock").remove(image);
    }

    /// Publish a client for a ready endpoint.
    ///
    /// The target address is the pod's headless-service DNS name, not the pod
    /// IP, so the handle survives IP churn across restarts.
    pub fn set_client(&self, image: &Image, pod_name: &str, pod_ip: &str) -> Result<()> {
        let address = format!(
            "{}.{}.svc.cluster.local:{}",
            pod_name, self.namespace, WORKER_GRPC_PORT
        );
        debug!(image = %image, address = %address, pod_ip, "publishing worker client");
        let mut guard = self.entries.write().expect("image store lock");
        let entry = guard
            .get_mut(image)
            .ok_or_else(|| anyhow!("cannot set client for unknown image: {}", image))?;
        match image.kind {
            ImageKind::Function => entry.fn_client = Some(self.connector.fn_client(&address)?),
            ImageKind::Service => entry.svc_client = Some(self.connector.svc_client(&address)?),
        }
        Ok(())
    }

    /// Retract any published client; the endpoint is no longer ready.
    pub fn delete_client(&self, image: &Image) {
        if let Some(entry) = self.entries.write().expect("image store lock").get_mut(image) {
            debug!(image = %image, "retracting worker client");
            entry.fn_client = None;
            entry.svc_client = None;
        }
    }

    pub fn fn_client(&self, image: &Image) -> Option<FnClient> {
        self.entries
            .read()
            .expect("image store lock")
            .get(image)
            .and_then(|e| e.fn_client.clone())
    }

    pub fn svc_client(&self, image: &Image) -> Option<SvcClient> {
        self.entries
            .read()
            .expect("image store lock")
            .get(image)
            .and_then(|e| e.svc_client.clone())
    }
}

struct ControllerCtx {
    config: Option<String>,
    images: Arc<ImageStore>,
}

/// Top level of the registry: one context per configured controller.
pub struct ControllerStore {
    namespace: String,
    connector: Arc<dyn WorkerConnector>,
    inner: RwLock<HashMap<String, ControllerCtx>>,
}

impl ControllerStore {
    pub fn new(namespace: impl Into<String>, connector: Arc<dyn WorkerConnector>) -> Self {
        Self {
            namespace: namespace.into(),
            connector,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.inner.read().expect("controller store lock").keys().cloned().collect()
    }

    pub fn exists(&self, controller: &str) -> bool {
        self.inner.read().expect("controller store lock").contains_key(controller)
    }

    /// Idempotent: an existing controller context is left untouched.
    pub fn create(&self, controller: &str) {
        let mut guard = self.inner.write().expect("controller store lock");
        guard.entry(controller.to_string()).or_insert_with(|| ControllerCtx {
            config: None,
            images: Arc::new(ImageStore::new(self.namespace.clone(), self.connector.clone())),
        });
    }

    pub fn delete(&self, controller: &str) {
        self.inner.write().expect("controller store lock").remove(controller);
    }

    pub fn set_config(&self, controller: &str, config: String) -> Result<()> {
        let mut guard = self.inner.write().expect("controller store lock");
        let ctx = guard
            .get_mut(controller)
            .ok_or_else(|| anyhow!("cannot set config, controller not initialized: {}", controller))?;
        ctx.config = Some(config);
        Ok(())
    }

    pub fn config(&self, controller: &str) -> Option<String> {
        self.inner
            .read()
            .expect("controller store lock")
            .get(controller)
            .and_then(|c| c.config.clone())
    }

    pub fn image_store(&self, controller: &str) -> Option<Arc<ImageStore>> {
        self.inner
            .read()
            .expect("controller store lock")
            .get(controller)
            .map(|c| c.images.clone())
    }
}

impl ClientLookup for ControllerStore {
    fn fn_client(&self, controller: &str, image: &Image) -> Option<FnClient> {
        self.image_store(controller)?.fn_client(image)
    }

    fn svc_client(&self, controller: &str, image: &Image) -> Option<SvcClient> {
        self.image_store(controller)?.svc_client(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use weft_proxy::{
        ExecuteRequest, ExecuteResponse, FunctionExecutor, FunctionService, ProxyError,
        ResourceRequest, ResourceResponse,
    };

    struct StubTransport;

    #[async_trait]
    impl FunctionExecutor for StubTransport {
        async fn execute(&self, _req: ExecuteRequest) -> Result<ExecuteResponse, ProxyError> {
            Ok(ExecuteResponse::default())
        }
    }

    #[async_trait]
    impl FunctionService for StubTransport {
        async fn apply_resource(&self, _req: ResourceRequest) -> Result<ResourceResponse, ProxyError> {
            Ok(ResourceResponse::default())
        }
        async fn delete_resource(&self, _req: ResourceRequest) -> Result<(), ProxyError> {
            Ok(())
        }
    }

    struct StubConnector;

    impl WorkerConnector for StubConnector {
        fn fn_client(&self, address: &str) -> Result<FnClient> {
            Ok(FnClient::new(address, Arc::new(StubTransport)))
        }
        fn svc_client(&self, address: &str) -> Result<SvcClient> {
            Ok(SvcClient::new(address, Arc::new(StubTransport)))
        }
    }

    fn store() -> ImageStore {
        ImageStore::new("weft-system", Arc::new(StubConnector))
    }

    #[test]
    fn create_is_idempotent_and_keeps_clients() {
        let s = store();
        let img = Image::function("gcr.io/x/fn:v1");
        s.create(img.clone());
        s.set_client(&img, "fn-x-01234567", "10.0.0.1").unwrap();
        assert!(s.fn_client(&img).is_some());

        s.create(img.clone());
        assert!(s.fn_client(&img).is_some(), "re-create must keep the published client");
    }

    #[test]
    fn client_address_is_the_headless_service_dns_name() {
        let s = store();
        let img = Image::function("img");
        s.create(img.clone());
        s.set_client(&img, "img-ctrl-01234567", "10.1.2.3").unwrap();
        let c = s.fn_client(&img).unwrap();
        assert_eq!(c.address(), "img-ctrl-01234567.weft-system.svc.cluster.local:9446");
    }

    #[test]
    fn at_most_one_client_matching_the_image_kind() {
        let s = store();
        let func = Image::function("img");
        let svc = Image::service("img");
        s.create(func.clone());
        s.create(svc.clone());
        s.set_client(&func, "p", "ip").unwrap();
        s.set_client(&svc, "p", "ip").unwrap();

        assert!(s.fn_client(&func).is_some());
        assert!(s.svc_client(&func).is_none());
        assert!(s.svc_client(&svc).is_some());
        assert!(s.fn_client(&svc).is_none());
    }

    #[test]
    fn readiness_flap_publishes_and_retracts() {
        let s = store();
        let img = Image::function("img");
        s.create(img.clone());

        s.set_client(&img, "p", "ip").unwrap();
        assert!(s.fn_client(&img).is_some());
        s.delete_client(&img);
        assert!(s.fn_client(&img).is_none());
        s.set_client(&img, "p", "ip").unwrap();
        assert!(s.fn_client(&img).is_some());
    }

    #[test]
    fn set_client_for_unknown_image_fails() {
        let s = store();
        assert!(s.set_client(&Image::function("img"), "p", "ip").is_err());
    }

    #[test]
    fn controller_store_routes_lookups() {
        let cs = ControllerStore::new("ns", Arc::new(StubConnector));
        cs.create("topo");
        let img = Image::function("img");
        let is = cs.image_store("topo").unwrap();
        is.create(img.clone());
        is.set_client(&img, "p", "ip").unwrap();

        assert!(ClientLookup::fn_client(&cs, "topo", &img).is_some());
        assert!(ClientLookup::fn_client(&cs, "other", &img).is_none());
        cs.set_config("topo", "doc".into()).unwrap();
        assert_eq!(cs.config("topo").as_deref(), Some("doc"));
        assert!(cs.set_config("other", "doc".into()).is_err());
    }
}
