//! JSON-over-HTTP reference transport for worker endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::client::{FnClient, FunctionExecutor, FunctionService, SvcClient, WorkerConnector};
use crate::context::{ExecuteRequest, ExecuteResponse, ResourceRequest, ResourceResponse};
use crate::ProxyError;

/// Builds HTTP clients against `http://<address>/…`.
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl WorkerConnector for HttpConnector {
    fn fn_client(&self, address: &str) -> Result<FnClient> {
        let transport = HttpTransport::new(self.client.clone(), address);
        Ok(FnClient::new(address, Arc::new(transport)))
    }

    fn svc_client(&self, address: &str) -> Result<SvcClient> {
        let transport = HttpTransport::new(self.client.clone(), address);
        Ok(SvcClient::new(address, Arc::new(transport)))
    }
}

struct HttpTransport {
    client: reqwest::Client,
    base: String,
}

impl HttpTransport {
    fn new(client: reqwest::Client, address: &str) -> Self {
        Self { client, base: format!("http://{address}") }
    }

    async fn post<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp, ProxyError> {
        let url = format!("{}/{}", self.base, path);
        debug!(url = %url, "worker call");
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(to_proxy_error)?;
        let resp = resp.error_for_status().map_err(|e| ProxyError::Worker(e.to_string()))?;
        resp.json::<Resp>().await.map_err(to_proxy_error)
    }
}

fn to_proxy_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::DeadlineExceeded
    } else {
        ProxyError::Transport(e.to_string())
    }
}

#[async_trait]
impl FunctionExecutor for HttpTransport {
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, ProxyError> {
        self.post("execute", &req).await
    }
}

#[async_trait]
impl FunctionService for HttpTransport {
    async fn apply_resource(&self, req: ResourceRequest) -> Result<ResourceResponse, ProxyError> {
        self.post("apply", &req).await
    }

    async fn delete_resource(&self, req: ResourceRequest) -> Result<(), ProxyError> {
        let _: serde_json::Value = self.post("delete", &req).await?;
        Ok(())
    }
}
