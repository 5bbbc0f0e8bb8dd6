//! # flowline-core
//!
//! Graph execution for flowline pipelines.
//!
//! A pipeline is a [`Flow`]: a graph of [`Node`]s whose `post` phase returns
//! an action string that selects the next node. Every node reads from and
//! writes to one [`SharedContext`] per run.
//!
//! ## Modules
//!
//! - [`context`] - the shared key-value context and typed keys
//! - [`node`] - the three-phase node contract, closure nodes and the blocking bridge
//! - [`flow`] - action-labelled graphs of nodes
//! - [`parallel`] - fan-out over independent branches with ordered merge
//! - [`batch`] - one template run per parameter set, and per-item batch nodes
//! - [`error`] - [`FlowError`] and the aggregate failure types
//!
//! ## Example
//!
//! ```rust,no_run
//! use flowline_core::{Flow, FnNode, SharedContext, DEFAULT_ACTION};
//! use serde_json::json;
//!
//! # async fn example() -> flowline_core::Result<()> {
//! let load = FnNode::new("load")
//!     .with_post(|ctx, _, _| {
//!         ctx.insert("numbers", json!([1, 2, 3]));
//!         Ok(DEFAULT_ACTION.to_string())
//!     })
//!     .into_ref();
//! let total = FnNode::new("total")
//!     .with_prep(|ctx| Ok(ctx.get_raw("numbers").cloned().unwrap_or_default()))
//!     .with_exec(|numbers| async move {
//!         let sum: i64 = numbers.as_array().into_iter().flatten().filter_map(|n| n.as_i64()).sum();
//!         Ok(json!(sum))
//!     })
//!     .with_post(|ctx, _, sum| {
//!         ctx.insert("total", sum.unwrap_or_default());
//!         Ok("done".to_string())
//!     })
//!     .into_ref();
//!
//! let mut flow = Flow::new("sum", load.clone());
//! flow.add_edge(&load, DEFAULT_ACTION, total);
//!
//! let mut ctx = SharedContext::new();
//! assert_eq!(flow.run(&mut ctx).await?, "done");
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod context;
pub mod error;
pub mod flow;
pub mod node;
pub mod parallel;

pub use batch::{BatchItemResult, BatchRun, ParallelBatchFlow, ParallelBatchNode, DEFAULT_RESULTS_KEY};
pub use context::{ContextChanges, ContextKey, Params, SharedContext, ERROR_KEY};
pub use error::{AggregateError, BranchFailure, FailureScope, FlowError, PreparationError, Result};
pub use flow::{Flow, PostHook};
pub use node::{
    default_post, run_lifecycle, Action, BlockingNode, ExecOutcome, FnNode, Node, NodeRef, SyncNode,
    DEFAULT_ACTION, ERROR_ACTION,
};
pub use parallel::{ParallelFlow, ParallelRun, DEFAULT_GLOBAL_CONCURRENCY};
