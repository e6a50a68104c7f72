//! Structural constructor vertices: slice builds a list, map builds an
//! object, both from jq evaluations over the assembled input.

use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};

use weft_engine::{FunctionKind, Input, OutputMap, VertexContext};

use super::{fill_outputs, jq};

pub fn run(vertex: &VertexContext, input: &Input) -> Result<OutputMap> {
    let expr = vertex
        .function
        .expression
        .as_deref()
        .ok_or_else(|| anyhow!("{} vertex {} without an expression", vertex.function.kind.as_str(), vertex.name))?;

    let evaluations = evaluate(expr, &vertex.function, input)?;
    let data = match vertex.function.kind {
        FunctionKind::Slice => {
            let mut items = Vec::new();
            for v in evaluations {
                match v {
                    Value::Array(xs) => items.extend(xs),
                    other => items.push(other),
                }
            }
            Value::Array(items)
        }
        FunctionKind::Map => {
            let mut merged = Map::new();
            for v in evaluations {
                match v {
                    Value::Object(obj) => merged.extend(obj),
                    other => bail!(
                        "map vertex {} expression must produce objects, got: {}",
                        vertex.name,
                        other
                    ),
                }
            }
            Value::Object(merged)
        }
        other => bail!("not a structural vertex kind: {}", other.as_str()),
    };

    Ok(fill_outputs(vertex, data))
}

/// One evaluation per range item (VALUE/INDEX bound), or a single one when
/// the vertex declares no range.
fn evaluate(expr: &str, spec: &weft_engine::FunctionSpec, input: &Input) -> Result<Vec<Value>> {
    let base = jq::bindings(input);
    match jq::eval_range(spec, input)? {
        None => Ok(vec![jq::run_once(expr, &base)?]),
        Some(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let mut vars = base.clone();
                vars.push(("VALUE".to_string(), item));
                vars.push(("INDEX".to_string(), Value::from(index)));
                out.push(jq::run_once(expr, &vars)?);
            }
            Ok(out)
        }
    }
}
