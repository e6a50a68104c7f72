//! Weft vertex functions: typed dispatch by function kind, the per-vertex
//! runners, and the builder that wires a DAG execution together.

#![forbid(unsafe_code)]

pub mod builder;
pub mod fnmap;
pub mod functions;
pub mod handler;

pub use builder::{new_execution, Execution, ExecutionConfig};
pub use fnmap::{FnConfig, FnError, FuncMap};
pub use handler::ExecHandler;
