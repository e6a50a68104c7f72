#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use weft_engine::{DagExecutor, DagSpec, RuntimeDag, VertexContext, VertexHandler};

fn dag(yaml: &str) -> Arc<RuntimeDag> {
    let spec: DagSpec = serde_yaml::from_str(yaml).unwrap();
    Arc::new(RuntimeDag::from_spec(spec).unwrap())
}

const DIAMOND: &str = r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  a:
    function: { kind: jq, expression: "." }
    references: [cr]
  b:
    function: { kind: jq, expression: "." }
    references: [cr]
  join:
    function: { kind: template, template: "{}" }
    references: [a, b]
"#;

#[derive(Debug, Clone)]
struct Span {
    name: String,
    start: Instant,
    end: Instant,
    ok: bool,
}

/// Test handler: records a span per vertex, sleeps a bit to make overlap
/// observable, optionally fails named vertices or parks until cancellation.
struct Recorder {
    spans: Mutex<Vec<Span>>,
    fail: HashSet<String>,
    park_on_cancel: HashSet<String>,
    sleep: Duration,
    post_runs: Mutex<Vec<bool>>,
}

impl Recorder {
    fn new(sleep: Duration) -> Self {
        Self {
            spans: Mutex::new(Vec::new()),
            fail: HashSet::new(),
            park_on_cancel: HashSet::new(),
            sleep,
            post_runs: Mutex::new(Vec::new()),
        }
    }

    fn span(&self, name: &str) -> Span {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("vertex {name} never ran"))
            .clone()
    }

    fn ran(&self) -> HashSet<String> {
        self.spans.lock().unwrap().iter().map(|s| s.name.clone()).collect()
    }
}

#[async_trait]
impl VertexHandler for Recorder {
    async fn run_vertex(&self, cancel: CancellationToken, vertex: VertexContext) -> bool {
        let start = Instant::now();
        if self.park_on_cancel.contains(&vertex.name) {
            cancel.cancelled().await;
        } else if !self.sleep.is_zero() {
            tokio::time::sleep(self.sleep).await;
        }
        let ok = !self.fail.contains(&vertex.name);
        self.spans.lock().unwrap().push(Span {
            name: vertex.name,
            start,
            end: Instant::now(),
            ok,
        });
        ok
    }

    fn post_run(&self, _start: Instant, _finish: Instant, success: bool) {
        self.post_runs.lock().unwrap().push(success);
    }
}

#[tokio::test]
async fn respects_topological_order() {
    let d = dag(DIAMOND);
    let h = Arc::new(Recorder::new(Duration::from_millis(10)));
    let ok = DagExecutor::new(d).run(h.clone(), CancellationToken::new()).await;
    assert!(ok);

    let cr = h.span("cr");
    let a = h.span("a");
    let b = h.span("b");
    let join = h.span("join");
    assert!(cr.end <= a.start);
    assert!(cr.end <= b.start);
    assert!(a.end <= join.start);
    assert!(b.end <= join.start);
    assert_eq!(h.post_runs.lock().unwrap().as_slice(), &[true]);
}

#[tokio::test]
async fn independent_vertices_overlap() {
    let d = dag(DIAMOND);
    let h = Arc::new(Recorder::new(Duration::from_millis(60)));
    DagExecutor::new(d).run(h.clone(), CancellationToken::new()).await;

    let a = h.span("a");
    let b = h.span("b");
    assert!(a.start < b.end && b.start < a.end, "a and b should run concurrently");
}

#[tokio::test]
async fn failure_does_not_stop_descendants() {
    let d = dag(DIAMOND);
    let mut rec = Recorder::new(Duration::ZERO);
    rec.fail.insert("a".to_string());
    let h = Arc::new(rec);
    let ok = DagExecutor::new(d).run(h.clone(), CancellationToken::new()).await;

    assert!(!ok, "overall success is the conjunction of vertex successes");
    let ran = h.ran();
    assert!(ran.contains("join"), "join must still run after a failed");
    assert_eq!(ran.len(), 4);
    assert!(!h.span("a").ok);
    assert!(h.span("join").ok);
    assert_eq!(h.post_runs.lock().unwrap().as_slice(), &[false]);
}

#[tokio::test]
async fn cancellation_drains_inflight_and_skips_the_rest() {
    let d = dag(DIAMOND);
    let mut rec = Recorder::new(Duration::ZERO);
    rec.park_on_cancel.insert("a".to_string());
    rec.park_on_cancel.insert("b".to_string());
    let h = Arc::new(rec);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let ran_to_completion = tokio::time::timeout(
        Duration::from_secs(2),
        DagExecutor::new(d).run(h.clone(), cancel),
    )
    .await;
    assert!(ran_to_completion.is_ok(), "engine must return after cancellation");

    let ran = h.ran();
    assert!(ran.contains("a") && ran.contains("b"), "in-flight vertices finish");
    assert!(!ran.contains("join"), "no new vertex starts after cancellation");
    assert_eq!(h.post_runs.lock().unwrap().len(), 1, "post_run fires exactly once");
}

#[tokio::test]
async fn single_chain_runs_every_vertex_once() {
    let d = dag(
        r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  a:
    function: { kind: jq, expression: "." }
    references: [cr]
  b:
    function: { kind: jq, expression: "." }
    references: [a]
"#,
    );
    let h = Arc::new(Recorder::new(Duration::ZERO));
    let ok = DagExecutor::new(d).run(h.clone(), CancellationToken::new()).await;
    assert!(ok);
    assert_eq!(h.spans.lock().unwrap().len(), 3);
}
