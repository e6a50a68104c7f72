//! The fronting proxy: routes execute/apply/delete calls to the worker
//! endpoint registered for (controller, image), under global admission
//! control.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use weft_core::Image;

use crate::client::{FnClient, FunctionExecutor, FunctionService, SvcClient};
use crate::context::{ExecuteRequest, ExecuteResponse, ResourceRequest, ResourceResponse};
use crate::ProxyError;

/// Read access to the per-controller client registry. Implemented by the
/// controller store; the proxy never owns client lifecycles.
pub trait ClientLookup: Send + Sync {
    fn fn_client(&self, controller: &str, image: &Image) -> Option<FnClient>;
    fn svc_client(&self, controller: &str, image: &Image) -> Option<SvcClient>;
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Semaphore size: worker RPCs in flight across all executions.
    pub max_in_flight: usize,
    /// Deadline for semaphore admission and for each downstream call.
    pub request_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { max_in_flight: 16, request_timeout: Duration::from_secs(60) }
    }
}

/// Fronting proxy server.
///
/// Every request takes one permit; admission and the downstream call are both
/// bounded so a hung worker cannot hold a permit indefinitely. Health for the
/// deployment itself is served by the fleet manager and intentionally does
/// not reflect worker health.
pub struct ProxyServer {
    lookup: Arc<dyn ClientLookup>,
    sem: Arc<Semaphore>,
    timeout: Duration,
}

impl ProxyServer {
    pub fn new(lookup: Arc<dyn ClientLookup>, cfg: ProxyConfig) -> Self {
        Self {
            lookup,
            sem: Arc::new(Semaphore::new(cfg.max_in_flight.max(1))),
            timeout: cfg.request_timeout,
        }
    }

    async fn with_permit<T, F>(&self, op: &'static str, fut: F) -> Result<T, ProxyError>
    where
        F: std::future::Future<Output = Result<T, ProxyError>>,
    {
        counter!("proxy_requests_total", 1u64, "op" => op);
        let permit = tokio::time::timeout(self.timeout, self.sem.acquire())
            .await
            .map_err(|_| {
                counter!("proxy_admission_deadline_total", 1u64, "op" => op);
                ProxyError::DeadlineExceeded
            })?
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        let out = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ProxyError::DeadlineExceeded)?;
        drop(permit);
        if let Err(e) = &out {
            warn!(op, error = %e, "proxied call failed");
        }
        out
    }

    fn not_ready(controller: &str, image: &Image) -> ProxyError {
        counter!("proxy_client_not_ready_total", 1u64);
        ProxyError::ClientNotReady { controller: controller.to_string(), image: image.name.clone() }
    }
}

#[async_trait]
impl FunctionExecutor for ProxyServer {
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, ProxyError> {
        let image = Image::function(&req.image);
        let client = self
            .lookup
            .fn_client(&req.controller, &image)
            .ok_or_else(|| Self::not_ready(&req.controller, &image))?;
        debug!(image = %req.image, controller = %req.controller, address = client.address(), "execute");
        self.with_permit("execute", client.execute(req)).await
    }
}

#[async_trait]
impl FunctionService for ProxyServer {
    async fn apply_resource(&self, req: ResourceRequest) -> Result<ResourceResponse, ProxyError> {
        let image = Image::service(&req.image);
        let client = self
            .lookup
            .svc_client(&req.controller, &image)
            .ok_or_else(|| Self::not_ready(&req.controller, &image))?;
        debug!(image = %req.image, controller = %req.controller, address = client.address(), "apply resource");
        self.with_permit("apply", client.apply_resource(req)).await
    }

    async fn delete_resource(&self, req: ResourceRequest) -> Result<(), ProxyError> {
        let image = Image::service(&req.image);
        let client = self
            .lookup
            .svc_client(&req.controller, &image)
            .ok_or_else(|| Self::not_ready(&req.controller, &image))?;
        debug!(image = %req.image, controller = %req.controller, address = client.address(), "delete resource");
        self.with_permit("delete", client.delete_resource(req)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ResourceContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor that tracks concurrency and parks for a while.
    struct SlowExecutor {
        current: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
    }

    #[async_trait]
    impl FunctionExecutor for SlowExecutor {
        async fn execute(&self, _req: ExecuteRequest) -> Result<ExecuteResponse, ProxyError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecuteResponse::default())
        }
    }

    struct FixedLookup {
        fn_client: Option<FnClient>,
    }

    impl ClientLookup for FixedLookup {
        fn fn_client(&self, _controller: &str, _image: &Image) -> Option<FnClient> {
            self.fn_client.clone()
        }
        fn svc_client(&self, _controller: &str, _image: &Image) -> Option<SvcClient> {
            None
        }
    }

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            image: "img".into(),
            controller: "ctrl".into(),
            resource_context: ResourceContext::new(),
        }
    }

    #[tokio::test]
    async fn missing_client_is_client_not_ready() {
        let proxy = ProxyServer::new(Arc::new(FixedLookup { fn_client: None }), ProxyConfig::default());
        let err = proxy.execute(request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::ClientNotReady { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn semaphore_bounds_concurrency() {
        let exec = Arc::new(SlowExecutor {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold: Duration::from_millis(50),
        });
        let lookup = FixedLookup {
            fn_client: Some(FnClient::new("w:1", exec.clone())),
        };
        let proxy = Arc::new(ProxyServer::new(
            Arc::new(lookup),
            ProxyConfig { max_in_flight: 2, request_timeout: Duration::from_secs(5) },
        ));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let p = proxy.clone();
            tasks.push(tokio::spawn(async move { p.execute(request()).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(exec.peak.load(Ordering::SeqCst) <= 2, "no more than K concurrent worker RPCs");
    }

    #[tokio::test]
    async fn blocked_request_deadlines_instead_of_queueing_forever() {
        let exec = Arc::new(SlowExecutor {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold: Duration::from_millis(400),
        });
        let lookup = FixedLookup {
            fn_client: Some(FnClient::new("w:1", exec)),
        };
        let proxy = Arc::new(ProxyServer::new(
            Arc::new(lookup),
            ProxyConfig { max_in_flight: 1, request_timeout: Duration::from_millis(100) },
        ));

        let holder = {
            let p = proxy.clone();
            tokio::spawn(async move { p.execute(request()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Permit is held; this request must deadline while queued.
        let err = proxy.execute(request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::DeadlineExceeded));
        // The holder itself also exceeds its call deadline.
        assert!(matches!(holder.await.unwrap(), Err(ProxyError::DeadlineExceeded)));
    }
}
