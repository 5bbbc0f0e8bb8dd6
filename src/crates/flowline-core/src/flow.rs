//! Directed graphs of nodes
//!
//! A [`Flow`] is a finite-state machine over nodes: each node's `post` returns
//! an action, and the edge table maps `(node, action)` to the next node.
//!
//! ```text
//!   ┌────────────┐ default ┌───────────┐ default ┌───────────┐
//!   │ load_files │────────▶│ summarize │────────▶│  render   │
//!   └────────────┘         └───────────┘         └───────────┘
//!                               │ error
//!                               ▼
//!                          ┌───────────┐
//!                          │  report   │
//!                          └───────────┘
//! ```
//!
//! The walk stops at the first action with no registered edge; the flow's own
//! post hook then runs exactly once and its return value is the flow's action.
//! Because a `Flow` is itself a [`Node`], flows nest inside larger flows.
//!
//! ```rust,ignore
//! let mut flow = Flow::new("docs", load.clone());
//! flow.add_edge(&load, DEFAULT_ACTION, summarize.clone())
//!     .add_edge(&summarize, DEFAULT_ACTION, render.clone())
//!     .add_edge(&summarize, ERROR_ACTION, report);
//!
//! let action = flow.run(&mut ctx).await?;
//! ```

use crate::context::SharedContext;
use crate::error::{FlowError, Result};
use crate::node::{Action, Node, NodeRef, ERROR_ACTION};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal hook run once after the walk ends
///
/// Receives the last node's action and returns the flow's action.
pub type PostHook = Arc<dyn Fn(&mut SharedContext, Action) -> Result<Action> + Send + Sync>;

fn same_node(a: &NodeRef, b: &NodeRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Graph of nodes connected by action-labelled edges
#[derive(Clone)]
pub struct Flow {
    name: String,
    start: NodeRef,
    nodes: HashMap<String, NodeRef>,
    edges: HashMap<String, HashMap<Action, NodeRef>>,
    conflicts: Vec<String>,
    post: Option<PostHook>,
    max_steps: Option<usize>,
}

impl Flow {
    /// Create a flow that starts at `start`
    pub fn new(name: impl Into<String>, start: NodeRef) -> Self {
        let mut flow = Self {
            name: name.into(),
            start: Arc::clone(&start),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            conflicts: Vec::new(),
            post: None,
            max_steps: None,
        };
        flow.register(&start);
        flow
    }

    /// Route `action` from `from` to `to`
    ///
    /// Registering the same `(from, action)` pair again replaces the target.
    pub fn add_edge(&mut self, from: &NodeRef, action: impl Into<Action>, to: NodeRef) -> &mut Self {
        self.register(from);
        self.register(&to);

        let action = action.into();
        let previous = self
            .edges
            .entry(from.name().to_string())
            .or_default()
            .insert(action.clone(), to);
        if previous.is_some() {
            warn!(flow = %self.name, from = from.name(), action = %action, "Edge replaced");
        }
        self
    }

    /// Set the terminal hook
    pub fn with_post<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut SharedContext, Action) -> Result<Action> + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(hook));
        self
    }

    /// Abort with an error after `max_steps` node executions
    ///
    /// Unbounded by default, since cycles in the graph are legal.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &NodeRef {
        &self.start
    }

    /// Target of `action` from the node named `from`
    pub fn successor(&self, from: &str, action: &str) -> Option<NodeRef> {
        self.edges.get(from)?.get(action).cloned()
    }

    /// Check the graph structure
    ///
    /// Edges are keyed by node name, so two distinct nodes sharing a name
    /// would make routing ambiguous.
    pub fn validate(&self) -> Result<()> {
        if self.conflicts.is_empty() {
            return Ok(());
        }
        Err(FlowError::Validation(format!(
            "flow '{}' has distinct nodes sharing a name: {}",
            self.name,
            self.conflicts.join(", ")
        )))
    }

    /// Walk the graph from the start node
    pub async fn run(&self, ctx: &mut SharedContext) -> Result<Action> {
        self.validate()?;

        let run_id = Uuid::new_v4();
        info!(flow = %self.name, %run_id, "Flow started");

        let mut current = Arc::clone(&self.start);
        let mut steps = 0usize;

        let last_action = loop {
            steps += 1;
            if let Some(limit) = self.max_steps {
                if steps > limit {
                    return Err(FlowError::execution(format!(
                        "flow '{}' exceeded {} steps",
                        self.name, limit
                    )));
                }
            }

            let action = current.run(ctx).await?;

            match self.successor(current.name(), &action) {
                Some(next) => {
                    debug!(flow = %self.name, from = current.name(), to = next.name(), action = %action, "Transition");
                    current = next;
                }
                None => {
                    if action == ERROR_ACTION {
                        warn!(flow = %self.name, node = current.name(), "Unrouted error action ends the flow");
                    } else {
                        debug!(flow = %self.name, node = current.name(), action = %action, "No edge for action, flow ends");
                    }
                    break action;
                }
            }
        };

        let action = match &self.post {
            Some(hook) => hook(ctx, last_action)?,
            None => last_action,
        };

        info!(flow = %self.name, %run_id, steps, action = %action, "Flow finished");
        Ok(action)
    }

    /// Run to completion from synchronous code
    ///
    /// Drives the flow on a private current-thread runtime, so it must not be
    /// called from inside an existing tokio runtime; use [`run`](Self::run)
    /// there instead.
    pub fn run_sync(&self, ctx: &mut SharedContext) -> Result<Action> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(FlowError::execution(format!(
                "flow '{}': run_sync called inside an async runtime, use run instead",
                self.name
            )));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FlowError::Runtime(e.into()))?;
        runtime.block_on(self.run(ctx))
    }

    fn register(&mut self, node: &NodeRef) {
        match self.nodes.get(node.name()) {
            Some(existing) if !same_node(existing, node) => {
                if !self.conflicts.iter().any(|name| name == node.name()) {
                    self.conflicts.push(node.name().to_string());
                }
            }
            Some(_) => {}
            None => {
                self.nodes.insert(node.name().to_string(), Arc::clone(node));
            }
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nodes: Vec<&String> = self.nodes.keys().collect();
        nodes.sort();
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("start", &self.start.name())
            .field("nodes", &nodes)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

#[async_trait]
impl Node for Flow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut SharedContext) -> Result<Action> {
        Flow::run(self, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FnNode, DEFAULT_ACTION};
    use serde_json::{json, Value};

    /// Appends its name to the `trail` array and returns `action`
    fn step(name: &'static str, action: &'static str) -> NodeRef {
        FnNode::new(name)
            .with_post(move |ctx, _, _| {
                let mut trail = ctx.get_raw("trail").cloned().unwrap_or_else(|| json!([]));
                if let Value::Array(items) = &mut trail {
                    items.push(json!(name));
                }
                ctx.insert("trail", trail);
                Ok(action.to_string())
            })
            .into_ref()
    }

    #[tokio::test]
    async fn test_walks_edges_until_unrouted_action() {
        let a = step("a", DEFAULT_ACTION);
        let b = step("b", "finish");
        let c = step("c", DEFAULT_ACTION);

        let mut flow = Flow::new("linear", a.clone());
        flow.add_edge(&a, DEFAULT_ACTION, b.clone())
            .add_edge(&b, "retry", c);

        let mut ctx = SharedContext::new();
        let action = flow.run(&mut ctx).await.unwrap();

        assert_eq!(action, "finish");
        assert_eq!(ctx.get_raw("trail"), Some(&json!(["a", "b"])));
    }

    #[tokio::test]
    async fn test_post_hook_runs_once_with_last_action() {
        let a = step("a", "done");
        let flow = Flow::new("hooked", a).with_post(|ctx, last| {
            let runs = ctx.get_raw("post_runs").and_then(Value::as_u64).unwrap_or(0);
            ctx.insert("post_runs", runs + 1);
            Ok(format!("flow:{}", last))
        });

        let mut ctx = SharedContext::new();
        assert_eq!(flow.run(&mut ctx).await.unwrap(), "flow:done");
        assert_eq!(ctx.get_raw("post_runs"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_nested_flow_is_a_node() {
        let inner_start = step("inner", "inner_done");
        let inner: NodeRef = Arc::new(Flow::new("sub", inner_start));
        let outer_start = step("outer", DEFAULT_ACTION);
        let last = step("last", "end");

        let mut flow = Flow::new("outer", outer_start.clone());
        flow.add_edge(&outer_start, DEFAULT_ACTION, inner.clone())
            .add_edge(&inner, "inner_done", last);

        let mut ctx = SharedContext::new();
        assert_eq!(flow.run(&mut ctx).await.unwrap(), "end");
        assert_eq!(ctx.get_raw("trail"), Some(&json!(["outer", "inner", "last"])));
    }

    #[tokio::test]
    async fn test_cycle_bounded_by_max_steps() {
        let looping = step("loop", "again");
        let mut flow = Flow::new("cycle", looping.clone());
        flow.add_edge(&looping, "again", looping.clone());
        let flow = flow.with_max_steps(5);

        let mut ctx = SharedContext::new();
        let err = flow.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, FlowError::Execution(_)));
        assert_eq!(ctx.get_raw("trail").and_then(Value::as_array).map(Vec::len), Some(5));
    }

    #[tokio::test]
    async fn test_conflicting_names_rejected() {
        let first = step("same", DEFAULT_ACTION);
        let second = step("same", DEFAULT_ACTION);
        let mut flow = Flow::new("ambiguous", first.clone());
        flow.add_edge(&first, DEFAULT_ACTION, second);

        assert!(matches!(flow.validate(), Err(FlowError::Validation(_))));
        assert!(flow.run(&mut SharedContext::new()).await.is_err());
    }

    #[test]
    fn test_run_sync_outside_runtime() {
        let a = step("a", DEFAULT_ACTION);
        let flow = Flow::new("sync", a);

        let mut ctx = SharedContext::new();
        assert_eq!(flow.run_sync(&mut ctx).unwrap(), DEFAULT_ACTION);
        assert_eq!(ctx.get_raw("trail"), Some(&json!(["a"])));
    }

    #[tokio::test]
    async fn test_run_sync_inside_runtime_refused() {
        let flow = Flow::new("sync", step("a", DEFAULT_ACTION));
        assert!(flow.run_sync(&mut SharedContext::new()).is_err());
    }
}
