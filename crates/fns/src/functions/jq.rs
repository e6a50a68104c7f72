//! jq expression evaluation.
//!
//! Expressions run with a null input; the vertex's input variables are bound
//! as jq variables (`$name`). Every produced value is collected into a list.

use anyhow::{anyhow, bail, Result};
use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};
use serde_json::Value;

use weft_engine::{FunctionSpec, Input, OutputMap, VertexContext};

use super::fill_outputs;

/// Evaluate an expression with the given variable bindings; all results are
/// collected into a list. A null-iteration error yields what was collected so
/// far, matching the semantics of an empty selection.
pub fn run_expression(expr: &str, vars: &[(String, Value)]) -> Result<Vec<Value>> {
    if expr.is_empty() {
        bail!("missing jq expression");
    }
    let names: Vec<String> = vars.iter().map(|(n, _)| n.clone()).collect();
    let values: Vec<Val> = vars.iter().map(|(_, v)| Val::from(v.clone())).collect();

    let mut defs = ParseCtx::new(names);
    defs.insert_natives(jaq_core::core());
    defs.insert_defs(jaq_std::std());

    let (parsed, errs) = jaq_parse::parse(expr, jaq_parse::main());
    if !errs.is_empty() {
        bail!("cannot parse jq expression {:?} ({} errors)", expr, errs.len());
    }
    let filter = defs.compile(parsed.ok_or_else(|| anyhow!("empty jq expression {:?}", expr))?);
    if !defs.errs.is_empty() {
        bail!("undefined names in jq expression {:?}", expr);
    }

    let inputs = RcIter::new(core::iter::empty());
    let mut out = Vec::new();
    for item in filter.run((Ctx::new(values, &inputs), Val::from(Value::Null))) {
        match item {
            Ok(v) => out.push(Value::from(v)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("as iterable") {
                    return Ok(out);
                }
                bail!("jq evaluation failed for {:?}: {}", expr, msg);
            }
        }
    }
    Ok(out)
}

/// Evaluate an expression and keep the first result only.
pub fn run_once(expr: &str, vars: &[(String, Value)]) -> Result<Value> {
    let mut results = run_expression(expr, vars)?;
    if results.is_empty() {
        return Ok(Value::Null);
    }
    Ok(results.swap_remove(0))
}

pub(crate) fn bindings(input: &Input) -> Vec<(String, Value)> {
    input.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Evaluate a vertex condition: false and null are falsy, anything else is
/// truthy; an empty selection is falsy.
pub fn eval_condition(expr: &str, input: &Input) -> Result<bool> {
    let v = run_once(expr, &bindings(input))?;
    Ok(!matches!(v, Value::Null | Value::Bool(false)))
}

/// Resolve a vertex's range expression into the items to iterate, if any.
pub(crate) fn eval_range(spec: &FunctionSpec, input: &Input) -> Result<Option<Vec<Value>>> {
    let Some(expr) = &spec.range else {
        return Ok(None);
    };
    let v = run_once(expr, &bindings(input))?;
    match v {
        Value::Array(items) => Ok(Some(items)),
        Value::Null => Ok(Some(Vec::new())),
        other => bail!("range expression {:?} must produce a list, got: {}", expr, other),
    }
}

/// The jq vertex: one evaluation, results recorded as a list under every
/// declared output variable.
pub fn run_vertex(vertex: &VertexContext, input: &Input) -> Result<OutputMap> {
    let expr = vertex
        .function
        .expression
        .as_deref()
        .ok_or_else(|| anyhow!("jq vertex {} without an expression", vertex.name))?;
    let results = run_expression(expr, &bindings(input))?;
    Ok(fill_outputs(vertex, Value::Array(results)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn binds_input_keys_as_variables() {
        let out = run_expression("$cr[0]", &vars(&[("cr", json!([1, 2]))])).unwrap();
        assert_eq!(out, vec![json!(1)]);
    }

    #[test]
    fn iterating_null_yields_an_empty_list() {
        let out = run_expression("$items[]", &vars(&[("items", Value::Null)])).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn collects_every_result() {
        let out = run_expression("$xs[] | . * 2", &vars(&[("xs", json!([1, 2, 3]))])).unwrap();
        assert_eq!(out, vec![json!(2), json!(4), json!(6)]);
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(run_expression("][", &[]).is_err());
        assert!(run_expression("", &[]).is_err());
    }

    #[test]
    fn conditions_follow_jq_truthiness() {
        let input = {
            let mut i = Input::new();
            i.add_entry("x", json!({"enabled": true}));
            i
        };
        assert!(eval_condition("$x.enabled", &input).unwrap());
        assert!(!eval_condition("$x.missing", &input).unwrap());
        assert!(!eval_condition("false", &input).unwrap());
        assert!(eval_condition("1", &input).unwrap());
    }
}
