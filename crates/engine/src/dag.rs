//! Runtime DAG model and the literal loader.
//!
//! Configuration documents carry per-operation DAG literals; this module
//! turns a deserialized literal into a validated [`RuntimeDag`].
//!
//! References name *variables*: a vertex's own name, an output variable a
//! sibling declares, or a variable produced inside a sibling block's nested
//! DAG (the block re-exports it). Each reference resolves to the owning
//! vertex for scheduling; input assembly reads the referenced variable from
//! the shared output as written.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Vertex function kinds the engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Root,
    Block,
    Slice,
    Map,
    Query,
    Template,
    Jq,
    Container,
    Wasm,
}

impl FunctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::Root => "root",
            FunctionKind::Block => "block",
            FunctionKind::Slice => "slice",
            FunctionKind::Map => "map",
            FunctionKind::Query => "query",
            FunctionKind::Template => "template",
            FunctionKind::Jq => "jq",
            FunctionKind::Container => "container",
            FunctionKind::Wasm => "wasm",
        }
    }
}

/// Per-kind payload of a vertex function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub kind: FunctionKind,
    /// Template text (template vertices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Expression (jq, slice and map vertices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Target kind for query vertices: an object carrying apiVersion/kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    /// Label selector for query vertices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
    /// Image reference (container/wasm vertices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Local executable (container vertices in exec mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    /// Declared input variables; container input is filtered to these.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    /// Optional jq expression producing the items to iterate over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    /// Optional jq expression gating execution; falsy skips the vertex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl FunctionSpec {
    pub fn of_kind(kind: FunctionKind) -> Self {
        Self {
            kind,
            template: None,
            expression: None,
            resource: None,
            selector: None,
            image: None,
            exec: None,
            vars: BTreeMap::new(),
            range: None,
            condition: None,
        }
    }
}

/// Declaration of one output variable of a vertex.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputDecl {
    /// Internal outputs never reach the final output set.
    #[serde(default)]
    pub internal: bool,
    /// Conditioned outputs need a side service call before they resolve.
    #[serde(default)]
    pub conditioned: bool,
    /// GVK key of the produced artifacts, when the variable carries objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gvk: Option<String>,
}

/// One vertex as written in a DAG literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexSpec {
    pub function: FunctionSpec,
    /// Variables whose values feed this vertex; each resolves to the vertex
    /// that produces it.
    #[serde(default)]
    pub references: Vec<String>,
    /// Output variables this vertex writes, keyed by variable name.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDecl>,
    /// Nested DAG literal (block vertices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<DagSpec>,
}

/// A DAG literal as it appears in a configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSpec {
    pub root: String,
    pub vertices: BTreeMap<String, VertexSpec>,
}

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("root vertex {0} is not declared")]
    MissingRoot(String),
    #[error("root vertex {0} must be of kind root and reference nothing")]
    BadRoot(String),
    #[error("vertex {vertex} references unknown variable {reference}")]
    UnknownReference { vertex: String, reference: String },
    #[error("variable {variable} is declared by both {first} and {second}")]
    DuplicateVariable { variable: String, first: String, second: String },
    #[error("cycle detected involving vertices: {0:?}")]
    Cycle(Vec<String>),
    #[error("vertex {0} of kind {1} is missing its payload")]
    MissingPayload(String, &'static str),
    #[error("block vertex {0} carries no nested dag")]
    MissingBlock(String),
    #[error("in block {block}: {source}")]
    Block {
        block: String,
        #[source]
        source: Box<DagError>,
    },
}

/// A fully resolved vertex: the literal plus its name and the derived
/// GVK-key → variable mapping used by image-producing vertices.
#[derive(Debug, Clone)]
pub struct VertexContext {
    pub name: String,
    pub function: FunctionSpec,
    pub references: Vec<String>,
    pub block_dag: Option<RuntimeDag>,
    pub outputs: BTreeMap<String, OutputDecl>,
    pub gvk_to_var: BTreeMap<String, String>,
}

impl VertexContext {
    /// All variable names this vertex makes visible to its siblings: its own
    /// name, its declared outputs, and (for blocks) every variable the
    /// nested DAG declares.
    fn exported_vars(&self) -> Vec<String> {
        let mut vars = vec![self.name.clone()];
        vars.extend(self.outputs.keys().cloned());
        if let Some(block) = &self.block_dag {
            for vc in block.vertices.values() {
                vars.extend(vc.exported_vars());
            }
        }
        vars.sort();
        vars.dedup();
        vars
    }
}

/// A validated runtime DAG. Immutable while an execution is running; shared
/// between executions as `Arc<RuntimeDag>`.
#[derive(Debug, Clone)]
pub struct RuntimeDag {
    root: String,
    vertices: BTreeMap<String, VertexContext>,
    /// Scheduling edges: vertex → unique predecessor vertices.
    predecessors: BTreeMap<String, Vec<String>>,
}

impl RuntimeDag {
    /// Build and validate a runtime DAG from a literal.
    pub fn from_spec(spec: DagSpec) -> Result<Self, DagError> {
        let DagSpec { root, vertices } = spec;

        let root_vertex = vertices
            .get(&root)
            .ok_or_else(|| DagError::MissingRoot(root.clone()))?;
        if root_vertex.function.kind != FunctionKind::Root || !root_vertex.references.is_empty() {
            return Err(DagError::BadRoot(root.clone()));
        }

        let mut resolved: BTreeMap<String, VertexContext> = BTreeMap::new();
        for (name, vs) in &vertices {
            check_payload(name, &vs.function)?;

            let block_dag = match (&vs.function.kind, &vs.block) {
                (FunctionKind::Block, Some(nested)) => {
                    Some(RuntimeDag::from_spec(nested.clone()).map_err(|e| DagError::Block {
                        block: name.clone(),
                        source: Box::new(e),
                    })?)
                }
                (FunctionKind::Block, None) => return Err(DagError::MissingBlock(name.clone())),
                _ => None,
            };

            let gvk_to_var = vs
                .outputs
                .iter()
                .filter_map(|(var, decl)| decl.gvk.as_ref().map(|g| (g.clone(), var.clone())))
                .collect();

            resolved.insert(
                name.clone(),
                VertexContext {
                    name: name.clone(),
                    function: vs.function.clone(),
                    references: vs.references.clone(),
                    block_dag,
                    outputs: vs.outputs.clone(),
                    gvk_to_var,
                },
            );
        }

        // Variable namespace: every reference must resolve to exactly one
        // owning vertex.
        let mut owner: BTreeMap<String, String> = BTreeMap::new();
        for (name, vc) in &resolved {
            for var in vc.exported_vars() {
                if let Some(existing) = owner.get(&var) {
                    if existing != name {
                        return Err(DagError::DuplicateVariable {
                            variable: var,
                            first: existing.clone(),
                            second: name.clone(),
                        });
                    }
                } else {
                    owner.insert(var, name.clone());
                }
            }
        }

        let mut predecessors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, vc) in &resolved {
            let mut preds = Vec::new();
            for reference in &vc.references {
                let owning = owner.get(reference).ok_or_else(|| DagError::UnknownReference {
                    vertex: name.clone(),
                    reference: reference.clone(),
                })?;
                if !preds.contains(owning) {
                    preds.push(owning.clone());
                }
            }
            predecessors.insert(name.clone(), preds);
        }

        let dag = Self { root, vertices: resolved, predecessors };
        dag.check_acyclic()?;
        Ok(dag)
    }

    pub fn root_vertex(&self) -> &str {
        &self.root
    }

    pub fn vertices(&self) -> &BTreeMap<String, VertexContext> {
        &self.vertices
    }

    pub fn vertex(&self, name: &str) -> Option<&VertexContext> {
        self.vertices.get(name)
    }

    pub fn predecessors_of(&self, name: &str) -> &[String] {
        self.predecessors.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Successor adjacency derived from the resolved reference edges.
    pub fn successors(&self) -> HashMap<String, Vec<String>> {
        let mut succ: HashMap<String, Vec<String>> =
            self.vertices.keys().map(|k| (k.clone(), Vec::new())).collect();
        for (name, preds) in &self.predecessors {
            for pred in preds {
                succ.get_mut(pred).expect("validated vertex").push(name.clone());
            }
        }
        succ
    }

    /// Unresolved-predecessor counters, the executor's initial state.
    pub fn predecessor_counts(&self) -> HashMap<String, usize> {
        self.predecessors
            .iter()
            .map(|(name, preds)| (name.clone(), preds.len()))
            .collect()
    }

    fn check_acyclic(&self) -> Result<(), DagError> {
        let mut counts = self.predecessor_counts();
        let successors = self.successors();
        let mut queue: VecDeque<String> = counts
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut seen = 0usize;
        while let Some(name) = queue.pop_front() {
            seen += 1;
            for succ in &successors[&name] {
                let c = counts.get_mut(succ).expect("validated vertex");
                *c -= 1;
                if *c == 0 {
                    queue.push_back(succ.clone());
                }
            }
        }
        if seen != self.vertices.len() {
            let stuck: Vec<String> = counts
                .into_iter()
                .filter(|(_, c)| *c > 0)
                .map(|(n, _)| n)
                .collect();
            return Err(DagError::Cycle(stuck));
        }
        Ok(())
    }
}

fn check_payload(name: &str, f: &FunctionSpec) -> Result<(), DagError> {
    match f.kind {
        FunctionKind::Template if f.template.is_none() => {
            Err(DagError::MissingPayload(name.to_string(), "template"))
        }
        FunctionKind::Jq | FunctionKind::Slice | FunctionKind::Map if f.expression.is_none() => {
            Err(DagError::MissingPayload(name.to_string(), "expression"))
        }
        FunctionKind::Query if f.resource.is_none() => {
            Err(DagError::MissingPayload(name.to_string(), "resource"))
        }
        FunctionKind::Container | FunctionKind::Wasm
            if f.image.is_none() && f.exec.is_none() =>
        {
            Err(DagError::MissingPayload(name.to_string(), "image or exec"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(yaml: &str) -> DagSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn loads_a_valid_literal() {
        let dag = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  names:
    function: { kind: jq, expression: "$cr[]" }
    references: [cr]
    outputs:
      names: { internal: true }
  render:
    function: { kind: template, template: "{}" }
    references: [names]
    outputs:
      rendered: { gvk: "v1/ConfigMap" }
"#,
        ))
        .unwrap();
        assert_eq!(dag.root_vertex(), "cr");
        assert_eq!(dag.vertices().len(), 3);
        let render = dag.vertex("render").unwrap();
        assert_eq!(render.gvk_to_var.get("v1/ConfigMap").unwrap(), "rendered");
        assert_eq!(dag.successors()["cr"], vec!["names".to_string()]);
        assert_eq!(dag.predecessors_of("render"), ["names".to_string()]);
    }

    #[test]
    fn references_resolve_to_declared_variables() {
        let dag = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  produce:
    function: { kind: jq, expression: "$cr" }
    references: [cr]
    outputs:
      answer: {}
  consume:
    function: { kind: jq, expression: "$answer" }
    references: [answer]
"#,
        ))
        .unwrap();
        assert_eq!(dag.predecessors_of("consume"), ["produce".to_string()]);
    }

    #[test]
    fn block_reexports_its_nested_variables() {
        let dag = RuntimeDag::from_spec(literal(
            r#"
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
          function: { kind: jq, expression: "1" }
          references: [inner]
          outputs:
            computed: { internal: true }
  after:
    function: { kind: jq, expression: "$computed" }
    references: [computed]
"#,
        ))
        .unwrap();
        assert_eq!(dag.predecessors_of("after"), ["blk".to_string()]);
    }

    #[test]
    fn rejects_unknown_reference() {
        let err = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  a:
    function: { kind: jq, expression: "." }
    references: [nope]
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, DagError::UnknownReference { .. }));
    }

    #[test]
    fn rejects_duplicate_variables() {
        let err = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  a:
    function: { kind: jq, expression: "." }
    references: [cr]
    outputs:
      shared: {}
  b:
    function: { kind: jq, expression: "." }
    references: [cr]
    outputs:
      shared: {}
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, DagError::DuplicateVariable { .. }));
    }

    #[test]
    fn rejects_cycles() {
        let err = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  a:
    function: { kind: jq, expression: "." }
    references: [cr, b]
  b:
    function: { kind: jq, expression: "." }
    references: [a]
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, DagError::Cycle(_)));
    }

    #[test]
    fn rejects_root_with_references() {
        let err = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: jq, expression: "." }
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, DagError::BadRoot(_)));
    }

    #[test]
    fn rejects_missing_payload_and_block() {
        let err = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  t:
    function: { kind: template }
    references: [cr]
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, DagError::MissingPayload(_, _)));

        let err = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  b:
    function: { kind: block }
    references: [cr]
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, DagError::MissingBlock(_)));
    }

    #[test]
    fn validates_nested_blocks() {
        let err = RuntimeDag::from_spec(literal(
            r#"
root: cr
vertices:
  cr:
    function: { kind: root }
  b:
    function: { kind: block }
    references: [cr]
    block:
      root: inner
      vertices:
        inner:
          function: { kind: root }
        x:
          function: { kind: jq, expression: "." }
          references: [missing]
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, DagError::Block { .. }));
    }
}
