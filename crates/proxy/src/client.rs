//! Worker client contracts and handles.
//!
//! The wire itself is an external collaborator: a [`WorkerConnector`] turns a
//! stable endpoint address into transport objects, and the handles here wrap
//! one transport with the address it was built for. Handles survive pod IP
//! changes because the address is the headless-service DNS name, never the
//! pod IP.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::{ExecuteRequest, ExecuteResponse, ResourceRequest, ResourceResponse};
use crate::ProxyError;

/// One-shot execution surface of a `Function` worker.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, ProxyError>;
}

/// Apply/delete surface of a `Service` worker.
#[async_trait]
pub trait FunctionService: Send + Sync {
    async fn apply_resource(&self, req: ResourceRequest) -> Result<ResourceResponse, ProxyError>;
    async fn delete_resource(&self, req: ResourceRequest) -> Result<(), ProxyError>;
}

/// Builds worker client transports for an endpoint address
/// (`<pod>.<namespace>.svc.cluster.local:<port>`).
pub trait WorkerConnector: Send + Sync {
    fn fn_client(&self, address: &str) -> Result<FnClient>;
    fn svc_client(&self, address: &str) -> Result<SvcClient>;
}

/// Client handle for a `Function` worker endpoint.
#[derive(Clone)]
pub struct FnClient {
    address: String,
    transport: Arc<dyn FunctionExecutor>,
}

impl FnClient {
    pub fn new(address: impl Into<String>, transport: Arc<dyn FunctionExecutor>) -> Self {
        Self { address: address.into(), transport }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Debug for FnClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnClient").field("address", &self.address).finish()
    }
}

#[async_trait]
impl FunctionExecutor for FnClient {
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, ProxyError> {
        self.transport.execute(req).await
    }
}

/// Client handle for a `Service` worker endpoint.
#[derive(Clone)]
pub struct SvcClient {
    address: String,
    transport: Arc<dyn FunctionService>,
}

impl SvcClient {
    pub fn new(address: impl Into<String>, transport: Arc<dyn FunctionService>) -> Self {
        Self { address: address.into(), transport }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Debug for SvcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvcClient").field("address", &self.address).finish()
    }
}

#[async_trait]
impl FunctionService for SvcClient {
    async fn apply_resource(&self, req: ResourceRequest) -> Result<ResourceResponse, ProxyError> {
        self.transport.apply_resource(req).await
    }

    async fn delete_resource(&self, req: ResourceRequest) -> Result<(), ProxyError> {
        self.transport.delete_resource(req).await
    }
}
