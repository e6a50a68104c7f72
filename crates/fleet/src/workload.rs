//! Worker pod and headless-service shapes, built as server-side-apply
//! documents.

use serde_json::{json, Value};

use weft_core::{
    DigestAndEntrypoint, Image, ImageKind, INIT_CONTAINER_NAME, VOLUME_MOUNT_PATH, VOLUME_NAME,
    WORKER_CONTAINER_NAME, WORKER_GRPC_PORT, WORKER_LABEL_KEY, WRAPPER_BIN,
};

/// Field manager for every apply the image controller issues.
pub const FIELD_MANAGER: &str = "weft-imagecontroller";

/// The worker pod document.
///
/// A `Function` image gets an init container that copies the wrapper binary
/// into a shared scratch volume, and its command is prefixed with
/// `<wrapper> --port <N> --`; a `Service` image runs its entrypoint as-is.
/// Both get a readiness probe on the wrapper gRPC port.
pub fn pod(
    image: &Image,
    pod_name: &str,
    namespace: &str,
    de: &DigestAndEntrypoint,
    wrapper_image: &str,
    owner: Option<&Value>,
) -> Value {
    let probe = json!({
        "grpc": { "port": WORKER_GRPC_PORT, "service": pod_name }
    });

    let spec = match image.kind {
        ImageKind::Function => {
            let mut command = vec![
                format!("{}/{}", VOLUME_MOUNT_PATH, WRAPPER_BIN),
                "--port".to_string(),
                WORKER_GRPC_PORT.to_string(),
                "--".to_string(),
            ];
            command.extend(de.entrypoint.iter().cloned());
            json!({
                "initContainers": [{
                    "name": INIT_CONTAINER_NAME,
                    "image": wrapper_image,
                    "command": ["cp", "-a", format!("/{}/.", WRAPPER_BIN), VOLUME_MOUNT_PATH],
                    "volumeMounts": [{ "name": VOLUME_NAME, "mountPath": VOLUME_MOUNT_PATH }],
                }],
                "containers": [{
                    "name": WORKER_CONTAINER_NAME,
                    "image": image.name,
                    "command": command,
                    "readinessProbe": probe,
                    "volumeMounts": [{ "name": VOLUME_NAME, "mountPath": VOLUME_MOUNT_PATH }],
                }],
                "volumes": [{ "name": VOLUME_NAME, "emptyDir": {} }],
            })
        }
        ImageKind::Service => {
            let mut container = json!({
                "name": WORKER_CONTAINER_NAME,
                "image": image.name,
                "readinessProbe": probe,
            });
            if !de.entrypoint.is_empty() {
                container["command"] = json!(de.entrypoint);
            }
            json!({ "containers": [container] })
        }
    };

    with_owner(
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "namespace": namespace,
                "name": pod_name,
                "labels": { WORKER_LABEL_KEY: pod_name },
            },
            "spec": spec,
        }),
        owner,
    )
}

/// The headless service: same name as the pod, `clusterIP: None`, one grpc
/// port, selector on the worker label. Its DNS name is the stable endpoint.
pub fn service(pod_name: &str, namespace: &str, owner: Option<&Value>) -> Value {
    with_owner(
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "namespace": namespace,
                "name": pod_name,
                "labels": { WORKER_LABEL_KEY: pod_name },
            },
            "spec": {
                "clusterIP": "None",
                "selector": { WORKER_LABEL_KEY: pod_name },
                "ports": [{
                    "name": "grpc",
                    "port": WORKER_GRPC_PORT,
                    "targetPort": WORKER_GRPC_PORT,
                    "protocol": "TCP",
                }],
            },
        }),
        owner,
    )
}

fn with_owner(mut doc: Value, owner: Option<&Value>) -> Value {
    if let Some(owner) = owner {
        doc["metadata"]["ownerReferences"] = json!([owner]);
    }
    doc
}
