//! Per-execution input and output containers.

use std::collections::BTreeMap;
use std::sync::RwLock;

use kube::core::GroupVersionKind;
use serde_json::Value;

/// One output cell. Written at most once per execution by the owning vertex.
#[derive(Debug, Clone, Default)]
pub struct OutputEntry {
    /// Internal cells never reach the final output set.
    pub internal: bool,
    /// Conditioned cells need a side service call before they resolve.
    pub conditioned: bool,
    pub gvk: Option<GroupVersionKind>,
    pub data: Value,
}

/// Plain map of output cells, the return value of a vertex function run.
pub type OutputMap = BTreeMap<String, OutputEntry>;

/// Output shared across one execution. Writers are exclusive per key; a
/// downstream vertex only reads a key after its owner completed, so the happy
/// path never contends.
#[derive(Debug, Default)]
pub struct Output {
    cells: RwLock<OutputMap>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, var: impl Into<String>, entry: OutputEntry) {
        self.cells.write().expect("output lock").insert(var.into(), entry);
    }

    /// Merge a vertex's produced cells into the shared output.
    pub fn merge(&self, cells: OutputMap) {
        if cells.is_empty() {
            return;
        }
        let mut guard = self.cells.write().expect("output lock");
        for (k, v) in cells {
            guard.insert(k, v);
        }
    }

    pub fn entry(&self, var: &str) -> Option<OutputEntry> {
        self.cells.read().expect("output lock").get(var).cloned()
    }

    /// The data of one cell, `Null` when absent.
    pub fn data(&self, var: &str) -> Value {
        self.cells
            .read()
            .expect("output lock")
            .get(var)
            .map(|e| e.data.clone())
            .unwrap_or(Value::Null)
    }

    pub fn entries(&self) -> OutputMap {
        self.cells.read().expect("output lock").clone()
    }

    pub fn len(&self) -> usize {
        self.cells.read().expect("output lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenation of every non-internal, list-shaped output cell.
    pub fn final_output(&self) -> Vec<Value> {
        let guard = self.cells.read().expect("output lock");
        let mut out = Vec::new();
        for entry in guard.values() {
            if entry.internal {
                continue;
            }
            if let Value::Array(items) = &entry.data {
                out.extend(items.iter().cloned());
            }
        }
        out
    }

    /// Cells whose declaration marked them conditioned.
    pub fn conditioned_output(&self) -> OutputMap {
        self.cells
            .read()
            .expect("output lock")
            .iter()
            .filter(|(_, e)| e.conditioned)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

/// Input assembled per vertex from predecessor outputs. Write-only during
/// assembly, read-only during execution.
#[derive(Debug, Clone, Default)]
pub struct Input {
    vars: BTreeMap<String, Value>,
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, var: impl Into<String>, value: Value) {
        self.vars.insert(var.into(), value);
    }

    pub fn value(&self, var: &str) -> Option<&Value> {
        self.vars.get(var)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// The input as a JSON object, the data model handed to templates.
    pub fn to_object(&self) -> Value {
        Value::Object(self.vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_output_concatenates_noninternal_lists() {
        let o = Output::new();
        o.add_entry("internal", OutputEntry { internal: true, data: json!([1]), ..Default::default() });
        o.add_entry("a", OutputEntry { data: json!([{"x": 1}, {"x": 2}]), ..Default::default() });
        o.add_entry("b", OutputEntry { data: json!([{"y": 3}]), ..Default::default() });
        o.add_entry("scalar", OutputEntry { data: json!("not-a-list"), ..Default::default() });

        let fo = o.final_output();
        assert_eq!(fo, vec![json!({"x": 1}), json!({"x": 2}), json!({"y": 3})]);
    }

    #[test]
    fn conditioned_output_filters_on_flag() {
        let o = Output::new();
        o.add_entry("plain", OutputEntry { data: json!([1]), ..Default::default() });
        o.add_entry("cond", OutputEntry { conditioned: true, data: json!([2]), ..Default::default() });
        let co = o.conditioned_output();
        assert_eq!(co.len(), 1);
        assert!(co.contains_key("cond"));
    }

    #[test]
    fn data_of_missing_cell_is_null() {
        let o = Output::new();
        assert_eq!(o.data("missing"), Value::Null);
    }
}
