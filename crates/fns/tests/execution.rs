#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use weft_engine::{DagSpec, ExecKind, Output, ResultLog, RuntimeDag};
use weft_fns::{new_execution, ExecutionConfig};
use weft_proxy::{ExecuteRequest, ExecuteResponse, FunctionExecutor, ProxyError, ResourceContext};

fn dag(yaml: &str) -> Arc<RuntimeDag> {
    let spec: DagSpec = serde_yaml::from_str(yaml).unwrap();
    Arc::new(RuntimeDag::from_spec(spec).unwrap())
}

struct Harness {
    output: Arc<Output>,
    results: Arc<ResultLog>,
}

async fn run(
    dag: Arc<RuntimeDag>,
    data: Value,
    executor: Option<Arc<dyn FunctionExecutor>>,
) -> (bool, Harness) {
    let output = Arc::new(Output::new());
    let results = Arc::new(ResultLog::new());
    let execution = new_execution(ExecutionConfig {
        controller_name: "topo".into(),
        name: "example".into(),
        namespace: "default".into(),
        root_gvk: None,
        data,
        dag,
        output: output.clone(),
        results: results.clone(),
        client: None,
        executor,
    });
    let ok = execution.run(CancellationToken::new()).await;
    (ok, Harness { output, results })
}

#[tokio::test]
async fn single_template_vertex() {
    let d = dag(r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  tpl:
    function: { kind: template, template: '{"name":"{{ cr }}"}' }
    references: [cr]
    outputs:
      tpl: {}
"#);
    let (ok, h) = run(d, json!("abc"), None).await;

    assert!(ok);
    assert_eq!(h.output.final_output(), vec![json!({"name": "abc"})]);

    let mut successes = 0;
    h.results.for_each(|e| {
        if !e.is_total() {
            assert!(e.success, "vertex {} failed: {}", e.vertex_name, e.reason);
            successes += 1;
        }
    });
    assert_eq!(successes, 2, "root and tpl entries");
    assert!(h.results.overall_success());
}

#[tokio::test]
async fn parallel_jq_vertices_join_at_a_template() {
    let d = dag(r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  a:
    function: { kind: jq, expression: "$cr[0]" }
    references: [cr]
    outputs:
      a: { internal: true }
  b:
    function: { kind: jq, expression: "$cr[1]" }
    references: [cr]
    outputs:
      b: { internal: true }
  join:
    function: { kind: template, template: '{"first":{{ a[0] }},"second":{{ b[0] }}}' }
    references: [a, b]
    outputs:
      join: {}
"#);
    let (ok, h) = run(d, json!([1, 2]), None).await;

    assert!(ok);
    assert_eq!(h.output.final_output(), vec![json!({"first": 1, "second": 2})]);
}

#[tokio::test]
async fn determinism_across_runs() {
    let spec = r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  a:
    function: { kind: jq, expression: "$cr[0]" }
    references: [cr]
    outputs:
      a: { internal: true }
  b:
    function: { kind: jq, expression: "$cr[1]" }
    references: [cr]
    outputs:
      b: { internal: true }
  join:
    function: { kind: template, template: '{"first":{{ a[0] }},"second":{{ b[0] }}}' }
    references: [a, b]
    outputs:
      join: {}
"#;
    let (_, first) = run(dag(spec), json!([1, 2]), None).await;
    let (_, second) = run(dag(spec), json!([1, 2]), None).await;
    assert_eq!(
        serde_json::to_vec(&first.output.final_output()).unwrap(),
        serde_json::to_vec(&second.output.final_output()).unwrap(),
        "two runs over the same input must be byte-identical"
    );
}

struct NotReadyExecutor;

#[async_trait]
impl FunctionExecutor for NotReadyExecutor {
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, ProxyError> {
        Err(ProxyError::ClientNotReady { controller: req.controller, image: req.image })
    }
}

#[tokio::test]
async fn container_without_ready_worker_fails_but_others_run() {
    let d = dag(r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  img:
    function: { kind: container, image: "gcr.io/x/fn:v1" }
    references: [cr]
    outputs:
      cms: { gvk: "v1/ConfigMap" }
  other:
    function: { kind: jq, expression: "$cr" }
    references: [cr]
    outputs:
      other: { internal: true }
"#);
    let (ok, h) = run(
        d,
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "seed"}}),
        Some(Arc::new(NotReadyExecutor)),
    )
    .await;

    assert!(!ok, "overall reconcile fails");
    let mut img_reason = String::new();
    let mut other_ran = false;
    h.results.for_each(|e| {
        if e.vertex_name == "img" {
            assert!(!e.success);
            img_reason = e.reason.clone();
        }
        if e.vertex_name == "other" {
            other_ran = true;
            assert!(e.success);
        }
    });
    assert!(img_reason.contains("client not ready"), "reason was: {img_reason}");
    assert!(other_ran, "subsequent vertices still run");
}

/// Worker double: hands back one ConfigMap derived from the request.
struct EchoExecutor;

#[async_trait]
impl FunctionExecutor for EchoExecutor {
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, ProxyError> {
        let seen: usize = req.resource_context.len();
        let mut rc = ResourceContext::new();
        rc.add_resource(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "produced"},
            "data": {"seen": seen.to_string()},
        }))
        .map_err(|e| ProxyError::Worker(e.to_string()))?;
        Ok(ExecuteResponse { resource_context: rc })
    }
}

#[tokio::test]
async fn container_records_worker_output_under_declared_variable() {
    let d = dag(r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  img:
    function: { kind: container, image: "gcr.io/x/fn:v1" }
    references: [cr]
    outputs:
      cms: { gvk: "v1/ConfigMap" }
"#);
    let (ok, h) = run(
        d,
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "seed"}}),
        Some(Arc::new(EchoExecutor)),
    )
    .await;

    assert!(ok);
    let fo = h.output.final_output();
    assert_eq!(fo.len(), 1);
    assert_eq!(fo[0]["metadata"]["name"], "produced");
    assert_eq!(fo[0]["data"]["seen"], "1", "the worker saw the root object");
}

#[tokio::test]
async fn condition_false_is_a_skip_not_a_failure() {
    let d = dag(r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  gated:
    function: { kind: jq, expression: "$cr", condition: "$cr.enabled" }
    references: [cr]
    outputs:
      gated: {}
  after:
    function: { kind: jq, expression: "[1]" }
    references: [cr]
    outputs:
      after: { internal: true }
"#);
    let (ok, h) = run(d, json!({"enabled": false}), None).await;

    assert!(ok, "a skipped vertex is not a failure");
    let mut gated_reason = String::new();
    let mut after_ran = false;
    h.results.for_each(|e| {
        if e.vertex_name == "gated" {
            assert!(e.success);
            gated_reason = e.reason.clone();
        }
        if e.vertex_name == "after" {
            after_ran = true;
        }
    });
    assert_eq!(gated_reason, "condition false");
    assert!(after_ran);
    assert!(h.output.entry("gated").is_none(), "skipped vertices write no cells");
}

#[tokio::test]
async fn block_outputs_are_visible_downstream() {
    let d = dag(r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  blk:
    function: { kind: block }
    references: [cr]
    block:
      root: inner
      vertices:
        inner:
          function: { kind: root }
        compute:
          function: { kind: jq, expression: "[21, 21]" }
          references: [inner]
          outputs:
            computed: { internal: true }
  sum:
    function: { kind: jq, expression: "[$computed | add]" }
    references: [computed]
    outputs:
      sum: { internal: true }
"#);
    let (ok, h) = run(d, json!({}), None).await;

    assert!(ok);
    assert_eq!(h.output.data("sum"), json!([42]));

    // Nested entries are recorded as block results alongside the outer ones.
    let mut block_entries = 0;
    h.results.for_each(|e| {
        if e.exec_kind == ExecKind::Block {
            block_entries += 1;
        }
    });
    assert!(block_entries >= 2, "inner root, compute and the block summary");
}
