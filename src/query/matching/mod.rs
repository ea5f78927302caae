//! Graph pattern matching (MATCH)
//!
//! - `pattern`: the alias graph built from MATCH expressions
//! - `traverser`: per-row edge traversal and binding merge
//! - `steps`: stream builders used by the MATCH step kinds
//! - `planner`: root selection and edge scheduling

pub mod pattern;
pub mod planner;
pub mod steps;
pub mod traverser;

pub use pattern::{AliasConstraints, Pattern};
pub use planner::MatchPlanner;
pub use traverser::{EdgeTraversal, MatchEdgeTraverser};
