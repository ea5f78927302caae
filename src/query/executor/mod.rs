//! Query execution engine using a pull-based step pipeline
//!
//! A plan is a chain of [`ExecutionStep`]s linked through `prev`. Starting the
//! last step starts its predecessors and returns an [`ExecutionStream`] that
//! produces [`Row`]s one pull at a time.

pub mod context;
pub mod control;
pub mod fetch;
pub mod mutation;
pub mod plan;
pub mod planner;
pub mod record;
pub mod step;
pub mod stream;
pub mod transform;

pub use context::{CommandContext, ScopedVariable};
pub use plan::{ExecutionPlan, PlanDescription, PlanState, SelectExecutionPlan, UpdateExecutionPlan};
pub use planner::{IndexCondPair, IndexSearchDescriptor, KeyCondition, SelectPlanner};
pub use record::{Row, RowKind, Value};
pub use step::{ExecutionStep, StepDescription, StepKind};
pub use stream::{ExecutionStream, StreamBox, StreamExt};

use crate::graph::StorageError;
use thiserror::Error;

/// Execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Data session error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Planning error
    #[error("Planning error: {0}")]
    PlanningError(String),

    /// A step that transforms an upstream was started without one
    #[error("Step {step} requires an upstream step")]
    MissingUpstream { step: String },

    /// Invalid step or plan construction
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Runtime error, naming the offending row or step
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Type error
    #[error("Type error: {0}")]
    TypeError(String),

    /// Variable not found
    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    /// `next` called on a stream with nothing left
    #[error("No more rows in stream")]
    Exhausted,

    /// Deadline reached during a pull
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Interrupt flag raised during a pull
    #[error("Execution interrupted")]
    Interrupted,

    /// Plan introspection could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutionError {
    /// True for failures a RETRY block may recover from by re-running the body
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Storage(StorageError::ConcurrentModification { .. }))
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;
