//! The vertex function runners.

pub mod block;
pub mod image;
pub mod jq;
pub mod local;
pub mod query;
pub mod structural;
pub mod template;

use weft_engine::{OutputEntry, OutputMap, VertexContext};

/// Record the produced data under every variable the vertex declares,
/// carrying each declaration's internal/conditioned/GVK flags.
pub(crate) fn fill_outputs(vertex: &VertexContext, data: serde_json::Value) -> OutputMap {
    vertex
        .outputs
        .iter()
        .map(|(var, decl)| {
            (
                var.clone(),
                OutputEntry {
                    internal: decl.internal,
                    conditioned: decl.conditioned,
                    gvk: decl.gvk.as_deref().and_then(|k| weft_core::parse_gvk_key(k).ok()),
                    data: data.clone(),
                },
            )
        })
        .collect()
}
