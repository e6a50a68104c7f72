//! Weft function proxy: worker protocol payloads, client contracts and the
//! fronting router that multiplexes vertex executions onto worker endpoints.

#![forbid(unsafe_code)]

pub mod client;
pub mod context;
pub mod http;
pub mod server;

pub use client::{FnClient, FunctionExecutor, FunctionService, SvcClient, WorkerConnector};
pub use context::{ExecuteRequest, ExecuteResponse, ResourceContext, ResourceRequest, ResourceResponse};
pub use http::HttpConnector;
pub use server::{ClientLookup, ProxyConfig, ProxyServer};

/// Errors surfaced by the proxy and by worker clients.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No ready worker endpoint for the requested image.
    #[error("client not ready for image {image} (controller {controller})")]
    ClientNotReady { controller: String, image: String },
    /// The caller's deadline elapsed while queued or mid-call.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The worker ran but reported a failure.
    #[error("worker error: {0}")]
    Worker(String),
    /// The wire itself failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProxyError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::ClientNotReady { .. } | ProxyError::DeadlineExceeded | ProxyError::Transport(_)
        )
    }
}
