//! Weft execution engine: runtime DAG model, per-execution containers and the
//! parallel topological executor.

#![forbid(unsafe_code)]

pub mod dag;
pub mod exec;
pub mod output;
pub mod result;

pub use dag::{DagError, DagSpec, FunctionKind, FunctionSpec, OutputDecl, RuntimeDag, VertexContext, VertexSpec};
pub use exec::{DagExecutor, VertexHandler};
pub use output::{Input, Output, OutputEntry, OutputMap};
pub use result::{ExecKind, ResultEntry, ResultLog};
