//! The primary-kind controller: watches the `for` kind, serializes
//! reconciles per object key, and fans watch-kind events into their
//! pipelines.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::TryStreamExt;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, Event};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CompiledConfig;
use crate::driver::{ReconcileDriver, ReconcileOutcome};
use crate::events::{EventKind, WatchEventHandler};

const WATCH_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    fn of(obj: &DynamicObject) -> Option<Self> {
        Some(Self {
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone()?,
        })
    }
}

fn queue_cap() -> usize {
    std::env::var("WEFT_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024)
}

pub struct PrimaryController {
    client: kube::Client,
    config: Arc<CompiledConfig>,
    driver: Arc<ReconcileDriver>,
    executor: Arc<dyn weft_proxy::FunctionExecutor>,
    concurrency: usize,
}

impl PrimaryController {
    pub fn new(
        client: kube::Client,
        config: Arc<CompiledConfig>,
        driver: Arc<ReconcileDriver>,
        executor: Arc<dyn weft_proxy::FunctionExecutor>,
        concurrency: usize,
    ) -> Self {
        Self { client, config, driver, executor, concurrency: concurrency.max(1) }
    }

    /// Run until cancelled. Reconciles of the same key are serialized by
    /// hashing the key onto one worker; different keys run concurrently.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let cap = queue_cap();
        let (key_tx, mut key_rx) = mpsc::channel::<ObjectKey>(cap);

        // Primary-kind watcher feeding the key queue.
        let watch = tokio::spawn(watch_keys(
            self.client.clone(),
            self.config.for_gvk.clone(),
            key_tx.clone(),
            cancel.clone(),
        ));

        // One event pipeline task per watched kind.
        let mut event_tasks = Vec::new();
        for (gvk_key, dag) in &self.config.watch_dags {
            let Ok(gvk) = weft_core::parse_gvk_key(gvk_key) else { continue };
            let handler = Arc::new(WatchEventHandler {
                controller_name: self.config.name.clone(),
                gvk: gvk.clone(),
                dag: dag.clone(),
                client: self.client.clone(),
                executor: self.executor.clone(),
            });
            event_tasks.push(tokio::spawn(watch_events(
                self.client.clone(),
                gvk,
                handler,
                cancel.clone(),
            )));
        }

        // Worker pool; a key always lands on the same worker.
        let mut worker_txs = Vec::with_capacity(self.concurrency);
        let mut workers = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            let (tx, rx) = mpsc::channel::<ObjectKey>(cap);
            worker_txs.push(tx);
            workers.push(tokio::spawn(worker_loop(
                self.driver.clone(),
                rx,
                key_tx.clone(),
                cancel.clone(),
            )));
        }
        drop(key_tx);

        info!(controller = %self.config.name, gvk = %weft_core::gvk_key(&self.config.for_gvk), "primary controller started");
        loop {
            tokio::select! {
                maybe = key_rx.recv() => match maybe {
                    Some(key) => {
                        let mut h = DefaultHasher::new();
                        key.hash(&mut h);
                        let idx = (h.finish() as usize) % worker_txs.len();
                        if worker_txs[idx].send(key).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        drop(worker_txs);
        for w in workers {
            let _ = w.await;
        }
        watch.abort();
        for t in event_tasks {
            t.abort();
        }
        info!(controller = %self.config.name, "primary controller stopped");
        Ok(())
    }
}

async fn worker_loop(
    driver: Arc<ReconcileDriver>,
    mut rx: mpsc::Receiver<ObjectKey>,
    requeue_tx: mpsc::Sender<ObjectKey>,
    cancel: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(k) => k,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };
        let outcome = driver
            .reconcile(cancel.clone(), key.namespace.as_deref(), &key.name)
            .await;
        let delay = match outcome {
            Ok(ReconcileOutcome::Done) => None,
            Ok(ReconcileOutcome::Requeue(d)) => Some(d),
            Err(e) => {
                warn!(name = %key.name, error = %e, "reconcile error");
                Some(WATCH_BACKOFF)
            }
        };
        if let Some(delay) = delay {
            counter!("reconcile_requeues_total", 1u64);
            let tx = requeue_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => { let _ = tx.send(key).await; }
                    _ = cancel.cancelled() => {}
                }
            });
        }
    }
}

/// Watch the primary kind and push object keys; restarts with backoff on
/// stream failure.
async fn watch_keys(
    client: kube::Client,
    gvk: GroupVersionKind,
    tx: mpsc::Sender<ObjectKey>,
    cancel: CancellationToken,
) {
    let ar = ApiResource::from_gvk(&gvk);
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        loop {
            let event = tokio::select! {
                ev = stream.try_next() => ev,
                _ = cancel.cancelled() => return,
            };
            match event {
                Ok(Some(Event::Applied(o))) | Ok(Some(Event::Deleted(o))) => {
                    if let Some(key) = ObjectKey::of(&o) {
                        if tx.send(key).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Some(Event::Restarted(list))) => {
                    for o in &list {
                        if let Some(key) = ObjectKey::of(o) {
                            if tx.send(key).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(gvk = %weft_core::gvk_key(&gvk), error = %e, "primary watch error");
                    counter!("watch_errors_total", 1u64);
                    break;
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(WATCH_BACKOFF) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

/// Watch one auxiliary kind and run its pipeline per event, synchronously on
/// this task.
async fn watch_events(
    client: kube::Client,
    gvk: GroupVersionKind,
    handler: Arc<WatchEventHandler>,
    cancel: CancellationToken,
) {
    let ar = ApiResource::from_gvk(&gvk);
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        loop {
            let event = tokio::select! {
                ev = stream.try_next() => ev,
                _ = cancel.cancelled() => return,
            };
            match event {
                Ok(Some(Event::Applied(o))) => handler.handle(EventKind::Update, &o).await,
                Ok(Some(Event::Deleted(o))) => handler.handle(EventKind::Delete, &o).await,
                Ok(Some(Event::Restarted(list))) => {
                    for o in &list {
                        handler.handle(EventKind::Generic, o).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(gvk = %weft_core::gvk_key(&gvk), error = %e, "event watch error");
                    counter!("watch_errors_total", 1u64);
                    break;
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(WATCH_BACKOFF) => {}
            _ = cancel.cancelled() => return,
        }
    }
}
