//! Error types for node and flow execution
//!
//! # Error Hierarchy
//!
//! ```text
//! FlowError
//! ├── Validation       - Graph structure errors (conflicting node names)
//! ├── Preparation      - A node's prep phase could not satisfy its preconditions
//! ├── TaskExecution    - A node's exec phase failed and the fallback re-raised
//! ├── Aggregate        - One or more fan-out branches or batch instances failed
//! ├── CircuitOpen      - Fast-fail rejection from an open circuit breaker
//! ├── Timeout          - A deadline expired
//! ├── Execution        - General execution errors
//! ├── Serialization    - Context values could not be (de)serialized
//! └── Runtime          - Errors bubbled up from flowline-runtime
//! ```
//!
//! # Propagation
//!
//! Failures are recovered as locally as possible. A failing `exec` is routed
//! to the node's fallback, which by default substitutes `null`; a failing
//! `prep` skips `exec` and is handed to `post` as a [`PreparationError`].
//! Fan-out primitives never return their branches' errors directly: they
//! collect them into an [`AggregateError`], record its message under the
//! context's `error` key and transition with the `"error"` action.
//!
//! ```rust
//! use flowline_core::error::{FlowError, PreparationError};
//!
//! fn describe(err: &FlowError) -> String {
//!     match err {
//!         FlowError::Preparation(prep) => format!("missing input for {}", prep.node),
//!         FlowError::CircuitOpen => "downstream unavailable, back off".to_string(),
//!         other => other.to_string(),
//!     }
//! }
//!
//! let err = FlowError::from(PreparationError::new("load_files", "no files in context"));
//! assert_eq!(describe(&err), "missing input for load_files");
//! ```

use flowline_runtime::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for node and flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors raised while building or running flows
#[derive(Error, Debug)]
pub enum FlowError {
    /// Graph structure is invalid
    #[error("Flow validation failed: {0}")]
    Validation(String),

    /// A node's preconditions were not met
    #[error(transparent)]
    Preparation(#[from] PreparationError),

    /// A node's exec phase failed
    #[error("Node '{node}' failed: {error}")]
    TaskExecution { node: String, error: String },

    /// Some fan-out branches or batch instances failed
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Rejected by an open circuit breaker without running
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// A deadline expired
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// General execution error
    #[error("Execution error: {0}")]
    Execution(String),

    /// A context value could not be converted
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error from the runtime primitives
    #[error(transparent)]
    Runtime(RuntimeError),
}

impl FlowError {
    /// Build a [`FlowError::TaskExecution`] for `node`
    pub fn task_execution(node: impl Into<String>, error: impl fmt::Display) -> Self {
        FlowError::TaskExecution {
            node: node.into(),
            error: error.to_string(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        FlowError::Execution(message.into())
    }
}

impl From<RuntimeError> for FlowError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::CircuitOpen => FlowError::CircuitOpen,
            RuntimeError::Timeout(limit) => FlowError::Timeout(limit),
            other => FlowError::Runtime(other),
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

/// Marker returned by a node's `prep` when its inputs are unusable
///
/// `exec` is skipped for that node and the marker is passed to `post`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Preparation failed in '{node}': {message}")]
pub struct PreparationError {
    pub node: String,
    pub message: String,
}

impl PreparationError {
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// What kind of unit failed inside an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    /// A branch of a `ParallelFlow`
    Branch,
    /// An instance of a `ParallelBatchFlow`
    Item,
}

impl FailureScope {
    fn singular(&self) -> &'static str {
        match self {
            FailureScope::Branch => "branch",
            FailureScope::Item => "item",
        }
    }

    fn plural(&self) -> &'static str {
        match self {
            FailureScope::Branch => "branches",
            FailureScope::Item => "items",
        }
    }
}

/// One failed branch or batch instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFailure {
    /// 1-based position in the fan-out
    pub position: usize,
    /// Name of the node that ran there
    pub name: String,
    pub error: String,
}

/// Combined failure of a fan-out
///
/// Renders as a single line naming every failed position, e.g.
/// `1 of 3 branches failed; branch 2 ('fetch'): connection reset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateError {
    pub scope: FailureScope,
    /// Number of branches or instances that ran
    pub total: usize,
    pub failures: Vec<BranchFailure>,
}

impl AggregateError {
    pub fn new(scope: FailureScope, total: usize, failures: Vec<BranchFailure>) -> Self {
        Self {
            scope,
            total,
            failures,
        }
    }

    /// 1-based positions that failed
    pub fn positions(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.position).collect()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.total == 1 {
            self.scope.singular()
        } else {
            self.scope.plural()
        };
        write!(f, "{} of {} {} failed", self.failures.len(), self.total, noun)?;
        for failure in &self.failures {
            write!(
                f,
                "; {} {} ('{}'): {}",
                self.scope.singular(),
                failure.position,
                failure.name,
                failure.error
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
