//! Append-only result log of one execution.

use std::sync::Mutex;
use std::time::Instant;

use crate::output::{Input, OutputMap};

/// Whether an entry belongs to the outer execution or a nested block run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    Root,
    Block,
}

/// Sentinel vertex name for the summary entry `post_run` records.
pub const TOTAL_VERTEX: &str = "total";

#[derive(Debug)]
pub struct ResultEntry {
    pub exec_kind: ExecKind,
    pub exec_name: String,
    pub vertex_name: String,
    pub start: Instant,
    pub end: Instant,
    pub input: Option<Input>,
    pub output: Option<OutputMap>,
    pub success: bool,
    pub reason: String,
}

impl ResultEntry {
    pub fn is_total(&self) -> bool {
        self.exec_kind == ExecKind::Root && self.vertex_name == TOTAL_VERTEX
    }
}

/// Append-only sequence of result entries, flushed (printed) at the end of an
/// execution. Shared between the outer engine and nested block engines.
#[derive(Debug, Default)]
pub struct ResultLog {
    entries: Mutex<Vec<ResultEntry>>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: ResultEntry) {
        self.entries.lock().expect("result lock").push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("result lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Conjunction of the per-vertex outcomes (summary entries excluded).
    pub fn overall_success(&self) -> bool {
        self.entries
            .lock()
            .expect("result lock")
            .iter()
            .filter(|e| !e.is_total())
            .all(|e| e.success)
    }

    /// Run a closure over the entries, in insertion order.
    pub fn for_each<F: FnMut(&ResultEntry)>(&self, mut f: F) {
        for e in self.entries.lock().expect("result lock").iter() {
            f(e);
        }
    }

    /// Log the per-vertex summary table and the overall duration line.
    pub fn print(&self) {
        let guard = self.entries.lock().expect("result lock");
        let mut total_success = true;
        let mut total_ms = 0.0f64;
        for (i, e) in guard.iter().enumerate() {
            if e.is_total() {
                total_ms = e.end.duration_since(e.start).as_secs_f64() * 1000.0;
                continue;
            }
            if !e.success {
                total_success = false;
            }
            tracing::info!(
                order = i,
                exec = %e.exec_name,
                vertex = %e.vertex_name,
                block = e.exec_kind == ExecKind::Block,
                duration_ms = e.end.duration_since(e.start).as_secs_f64() * 1000.0,
                success = e.success,
                reason = %e.reason,
                "vertex result"
            );
        }
        tracing::info!(duration_ms = total_ms, success = total_success, "overall result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vertex: &str, success: bool) -> ResultEntry {
        let now = Instant::now();
        ResultEntry {
            exec_kind: ExecKind::Root,
            exec_name: "cr".into(),
            vertex_name: vertex.into(),
            start: now,
            end: now,
            input: None,
            output: None,
            success,
            reason: String::new(),
        }
    }

    #[test]
    fn overall_success_ignores_the_total_entry() {
        let log = ResultLog::new();
        log.add(entry("a", true));
        log.add(entry("b", true));
        // summary entry marked failed must not flip the conjunction
        let mut total = entry(TOTAL_VERTEX, false);
        total.exec_kind = ExecKind::Root;
        log.add(total);
        assert!(log.overall_success());
    }

    #[test]
    fn overall_success_is_a_conjunction() {
        let log = ResultLog::new();
        log.add(entry("a", true));
        log.add(entry("b", false));
        assert!(!log.overall_success());
        assert_eq!(log.len(), 2);
    }
}
