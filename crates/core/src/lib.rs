//! Weft core types: images, worker identity and GVK keys.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

/// Port the worker wrapper listens on inside every worker pod.
pub const WORKER_GRPC_PORT: i32 = 9446;

/// Label applied to worker pods and their headless services.
pub const WORKER_LABEL_KEY: &str = "weft.dev/worker";

/// Label applied to configuration documents so watches can select them.
pub const CONFIG_LABEL_KEY: &str = "weft.dev/config";

/// Finalizer held on the primary resource and on configuration documents.
pub const FINALIZER: &str = "weft.dev/finalizer";

/// ConfigMap key under which the controller configuration document lives.
pub const CONFIG_DATA_KEY: &str = "controllerConfig";

pub const ENV_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_WRAPPER_IMAGE: &str = "WEFT_WRAPPER_IMAGE";
pub const DEFAULT_WRAPPER_IMAGE: &str = "ghcr.io/weft/fn-wrapper:latest";

pub const INIT_CONTAINER_NAME: &str = "copy-wrapper";
pub const WORKER_CONTAINER_NAME: &str = "function";
pub const WRAPPER_BIN: &str = "wrapper-server";
pub const VOLUME_NAME: &str = "wrapper";
pub const VOLUME_MOUNT_PATH: &str = "/wrapper";

/// Operating namespace for the process; `POD_NAMESPACE` or "default".
pub fn operating_namespace() -> String {
    std::env::var(ENV_NAMESPACE).unwrap_or_else(|_| "default".to_string())
}

/// Kind of a declared worker image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// One-shot executor invoked per request.
    Function,
    /// Long-lived worker supporting apply/delete of a resource.
    Service,
}

/// A worker image declared by a configuration document.
///
/// Images are globally unique by value: the same (name, kind) pair always
/// addresses the same worker fleet entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub kind: ImageKind,
}

impl Image {
    pub fn function(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ImageKind::Function }
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ImageKind::Service }
    }
}

impl std::fmt::Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", self.name, self.kind)
    }
}

/// Registry metadata for an image: immutable digest plus the entrypoint the
/// worker pod runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestAndEntrypoint {
    pub digest: String,
    pub entrypoint: Vec<String>,
}

/// Deterministic worker pod name for (controller, image, digest).
///
/// Same inputs always yield the same name, which is what makes the image
/// controller's server-side apply idempotent.
pub fn worker_pod_name(controller: &str, image: &str, digest: &str) -> Result<String> {
    let repo = image.split(['@', ':']).next().unwrap_or(image);
    let last = repo
        .split('/')
        .last()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("cannot derive pod name from image reference: {}", image))?;
    let name = last.replace('_', "-");
    let hex: String = digest
        .trim_start_matches("sha256:")
        .chars()
        .take(8)
        .collect();
    if hex.is_empty() {
        return Err(anyhow!("cannot derive pod name from empty digest for image: {}", image));
    }
    Ok(format!("{}-{}-{}", name, controller, hex))
}

/// Render a GVK as its key form, "v1/Kind" or "group/v1/Kind".
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Parse a GVK key ("v1/Kind" or "group/v1/Kind").
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Extract the GVK of a raw object from its apiVersion/kind fields.
pub fn gvk_of(value: &serde_json::Value) -> Option<GroupVersionKind> {
    let api_version = value.get("apiVersion")?.as_str()?;
    let kind = value.get("kind")?.as_str()?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Some(GroupVersionKind { group, version, kind: kind.to_string() })
}

pub mod prelude {
    pub use super::{
        gvk_key, gvk_of, parse_gvk_key, worker_pod_name, DigestAndEntrypoint, Image, ImageKind,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_name_is_deterministic_and_sanitized() {
        let a = worker_pod_name("topo", "gcr.io/kpt-fn/set_namespace:v1", "sha256:0123456789abcdef").unwrap();
        let b = worker_pod_name("topo", "gcr.io/kpt-fn/set_namespace:v1", "sha256:0123456789abcdef").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "set-namespace-topo-01234567");
    }

    #[test]
    fn pod_name_requires_digest() {
        assert!(worker_pod_name("topo", "img", "").is_err());
    }

    #[test]
    fn gvk_key_roundtrip() {
        for key in ["v1/ConfigMap", "apps/v1/Deployment"] {
            let gvk = parse_gvk_key(key).unwrap();
            assert_eq!(gvk_key(&gvk), key);
        }
        assert!(parse_gvk_key("justkind").is_err());
    }

    #[test]
    fn gvk_of_handles_core_and_grouped() {
        let core = serde_json::json!({"apiVersion": "v1", "kind": "Pod"});
        let gvk = gvk_of(&core).unwrap();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("", "v1", "Pod"));

        let grouped = serde_json::json!({"apiVersion": "apps/v1", "kind": "Deployment"});
        let gvk = gvk_of(&grouped).unwrap();
        assert_eq!(gvk.group, "apps");
        assert!(gvk_of(&serde_json::json!({"kind": "Pod"})).is_none());
    }
}
