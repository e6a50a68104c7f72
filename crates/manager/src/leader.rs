//! Lease-based leader election. When election is disabled every process
//! behaves as leader.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LEASE_SECONDS: i32 = 15;
const RETRY: Duration = Duration::from_secs(2);

pub struct LeaderElector {
    client: kube::Client,
    namespace: String,
    /// Lock id, `<unique-id>.<domain>`.
    lock_name: String,
    identity: String,
}

/// Held while this process is leader; `lost` fires when renewal fails.
pub struct Leadership {
    pub lost: mpsc::Receiver<()>,
    renew_task: JoinHandle<()>,
}

impl Leadership {
    pub fn stop(self) {
        self.renew_task.abort();
    }
}

impl LeaderElector {
    pub fn new(
        client: kube::Client,
        namespace: impl Into<String>,
        lock_name: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            lock_name: lock_name.into(),
            identity: identity.into(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Block until this process holds the lease, then keep renewing it in
    /// the background.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Leadership> {
        loop {
            if cancel.is_cancelled() {
                anyhow::bail!("cancelled while waiting for leadership");
            }
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => debug!(lock = %self.lock_name, "lease held elsewhere; waiting"),
                Err(e) => warn!(lock = %self.lock_name, error = %e, "lease attempt failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY) => {}
                _ = cancel.cancelled() => anyhow::bail!("cancelled while waiting for leadership"),
            }
        }
        info!(lock = %self.lock_name, identity = %self.identity, "acquired leadership");

        let (lost_tx, lost_rx) = mpsc::channel(1);
        let elector = LeaderElector::new(
            self.client.clone(),
            self.namespace.clone(),
            self.lock_name.clone(),
            self.identity.clone(),
        );
        let cancel = cancel.clone();
        let renew_task = tokio::spawn(async move {
            let period = Duration::from_secs((LEASE_SECONDS as u64) / 3);
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = cancel.cancelled() => return,
                }
                match elector.renew().await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "lease renewal failed");
                        if failures >= 3 {
                            let _ = lost_tx.send(()).await;
                            return;
                        }
                    }
                }
            }
        });
        Ok(Leadership { lost: lost_rx, renew_task })
    }

    /// One acquisition attempt. True when we hold the lease afterwards.
    async fn try_acquire(&self) -> Result<bool> {
        let api = self.api();
        let now = MicroTime(Utc::now());
        match api.get_opt(&self.lock_name).await? {
            None => {
                let lease: Lease = serde_json::from_value(json!({
                    "apiVersion": "coordination.k8s.io/v1",
                    "kind": "Lease",
                    "metadata": { "name": self.lock_name, "namespace": self.namespace },
                }))?;
                let mut lease = lease;
                lease.spec = Some(self.spec(&now, 1));
                api.create(&PostParams::default(), &lease)
                    .await
                    .context("cannot create lease")?;
                Ok(true)
            }
            Some(lease) => {
                let spec = lease.spec.unwrap_or_default();
                let holder = spec.holder_identity.as_deref().unwrap_or_default();
                if holder == self.identity {
                    return Ok(true);
                }
                let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
                    (Some(renew), Some(secs)) => {
                        Utc::now() - renew.0 > chrono::Duration::seconds(secs as i64)
                    }
                    _ => true,
                };
                if !expired {
                    return Ok(false);
                }
                let transitions = spec.lease_transitions.unwrap_or(0) + 1;
                self.patch_spec(&now, transitions).await?;
                Ok(true)
            }
        }
    }

    async fn renew(&self) -> Result<()> {
        let now = MicroTime(Utc::now());
        let current = self
            .api()
            .get_opt(&self.lock_name)
            .await?
            .and_then(|l| l.spec)
            .unwrap_or_default();
        if current.holder_identity.as_deref() != Some(&self.identity[..]) {
            anyhow::bail!("lease stolen by {:?}", current.holder_identity);
        }
        self.patch_spec(&now, current.lease_transitions.unwrap_or(0)).await
    }

    async fn patch_spec(&self, now: &MicroTime, transitions: i32) -> Result<()> {
        let patch = json!({ "spec": {
            "holderIdentity": self.identity,
            "leaseDurationSeconds": LEASE_SECONDS,
            "acquireTime": now,
            "renewTime": now,
            "leaseTransitions": transitions,
        }});
        self.api()
            .patch(&self.lock_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("cannot update lease")?;
        Ok(())
    }

    fn spec(
        &self,
        now: &MicroTime,
        transitions: i32,
    ) -> k8s_openapi::api::coordination::v1::LeaseSpec {
        k8s_openapi::api::coordination::v1::LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now.clone()),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}
