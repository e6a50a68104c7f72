//! Digest resolution contract.
//!
//! The registry is an external collaborator; the in-tree resolver only
//! accepts digest-pinned references, which keeps the deterministic pod name
//! derivable without a registry round-trip.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use weft_core::DigestAndEntrypoint;

#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve(&self, image: &str) -> Result<DigestAndEntrypoint>;
}

/// Resolves `name@sha256:…` references; anything unpinned is rejected with a
/// pointer at the fix.
#[derive(Debug, Default)]
pub struct PinnedResolver;

#[async_trait]
impl DigestResolver for PinnedResolver {
    async fn resolve(&self, image: &str) -> Result<DigestAndEntrypoint> {
        let digest = image
            .split_once('@')
            .map(|(_, d)| d)
            .filter(|d| d.starts_with("sha256:") && d.len() > "sha256:".len())
            .ok_or_else(|| {
                anyhow!(
                    "image {} is not digest-pinned; pin it as name@sha256:… or wire a registry resolver",
                    image
                )
            })?;
        Ok(DigestAndEntrypoint { digest: digest.to_string(), entrypoint: Vec::new() })
    }
}
