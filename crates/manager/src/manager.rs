//! The fleet manager: builds the shared stores and the proxy, elects a
//! leader when asked to, and runs one configuration manager per document
//! under a shared cancellation scope. The first subsystem error cancels the
//! others and propagates out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use weft_ctrl::{ConfigManager, ConfigManagerConfig};
use weft_fleet::{DigestResolver, PinnedResolver};
use weft_proxy::{HttpConnector, ProxyConfig, ProxyServer};
use weft_store::ControllerStore;

use crate::health;
use crate::leader::LeaderElector;

#[derive(Debug, Clone)]
pub struct FleetManagerConfig {
    pub namespace: String,
    /// Configuration document names, one controller each.
    pub config_names: Vec<String>,
    pub probe_addr: SocketAddr,
    pub leader_election: bool,
    /// Unique id of this process, also the lease lock prefix.
    pub unique_id: String,
    /// Operator domain, the lease lock suffix.
    pub domain: String,
    /// Reconcile worker count per controller.
    pub concurrency: usize,
    /// Delay before failed reconciles retry.
    pub poll_interval: Duration,
    /// Proxy admission limit.
    pub max_in_flight: usize,
    /// Worker RPC deadline.
    pub request_timeout: Duration,
    pub wrapper_image: String,
}

pub struct FleetManager {
    cfg: FleetManagerConfig,
    client: kube::Client,
    resolver: Arc<dyn DigestResolver>,
}

impl FleetManager {
    pub fn new(cfg: FleetManagerConfig, client: kube::Client) -> Self {
        Self { cfg, client, resolver: Arc::new(PinnedResolver) }
    }

    /// Swap the registry resolver (tests, or a real registry adapter).
    pub fn with_resolver(mut self, resolver: Arc<dyn DigestResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Run until the token is cancelled or a subsystem fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        anyhow::ensure!(!self.cfg.config_names.is_empty(), "at least one configuration document is required");
        anyhow::ensure!(!self.cfg.unique_id.is_empty(), "a unique id is required");

        let ready = Arc::new(AtomicBool::new(false));
        let probe = health::spawn(self.cfg.probe_addr, ready.clone(), cancel.clone());

        // Leadership gates everything that mutates the cluster.
        let mut leadership = None;
        if self.cfg.leader_election {
            let lock_name = format!("{}.{}", self.cfg.unique_id, self.cfg.domain);
            let elector = LeaderElector::new(
                self.client.clone(),
                self.cfg.namespace.clone(),
                lock_name,
                self.cfg.unique_id.clone(),
            );
            leadership = Some(elector.acquire(&cancel).await?);
        }

        let connector = Arc::new(
            HttpConnector::new(self.cfg.request_timeout).context("cannot build worker connector")?,
        );
        let store = Arc::new(ControllerStore::new(self.cfg.namespace.clone(), connector));
        for name in &self.cfg.config_names {
            store.create(name);
        }
        let proxy = Arc::new(ProxyServer::new(
            store.clone(),
            ProxyConfig {
                max_in_flight: self.cfg.max_in_flight,
                request_timeout: self.cfg.request_timeout,
            },
        ));

        let children = cancel.child_token();
        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);
        let mut tasks = Vec::new();
        for name in &self.cfg.config_names {
            let mut manager = ConfigManager::new(ConfigManagerConfig {
                client: self.client.clone(),
                namespace: self.cfg.namespace.clone(),
                controller_name: name.clone(),
                store: store.clone(),
                resolver: self.resolver.clone(),
                wrapper_image: self.cfg.wrapper_image.clone(),
                executor: proxy.clone(),
                concurrency: self.cfg.concurrency,
                requeue_after: self.cfg.poll_interval,
            });
            let child = children.clone();
            let err_tx = err_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = manager.start(child).await {
                    let _ = err_tx.send(e).await;
                }
            }));
        }
        drop(err_tx);
        ready.store(true, Ordering::Relaxed);
        info!(controllers = self.cfg.config_names.len(), "fleet manager running");

        // Block until cancelled or the first error.
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            maybe_err = err_rx.recv() => match maybe_err {
                Some(e) => {
                    error!(error = %e, "subsystem failed; shutting down");
                    Err(e)
                }
                None => Ok(()),
            },
            lost = wait_lost(&mut leadership) => {
                let _ = lost;
                Err(anyhow::anyhow!("leadership lost"))
            }
        };

        ready.store(false, Ordering::Relaxed);
        children.cancel();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(l) = leadership {
            l.stop();
        }
        cancel.cancel();
        let _ = probe.await;
        info!("fleet manager stopped");
        outcome
    }
}

async fn wait_lost(leadership: &mut Option<crate::leader::Leadership>) {
    match leadership {
        Some(l) => {
            let _ = l.lost.recv().await;
        }
        None => std::future::pending().await,
    }
}
