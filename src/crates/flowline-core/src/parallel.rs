//! Fan-out over independent branches
//!
//! Every branch of a [`ParallelFlow`] runs as its own tokio task on a private
//! copy of the context. Once all branches are done, each copy is diffed
//! against the pre-fan-out snapshot and the changed keys are merged back in
//! branch order, so on conflicting keys the later branch wins regardless of
//! which finished first.
//!
//! A branch fails when it returns an error, panics, or sets (or changes) the
//! `error` key in its copy. Changes from branches that returned normally are
//! still merged; the failures are combined into one [`AggregateError`] whose
//! message replaces the `error` key, and the flow transitions with `"error"`.

use crate::context::{SharedContext, ERROR_KEY};
use crate::error::{AggregateError, BranchFailure, FailureScope, FlowError, Result};
use crate::flow::PostHook;
use crate::node::{Action, Node, NodeRef, DEFAULT_ACTION, ERROR_ACTION};
use async_trait::async_trait;
use flowline_runtime::LoadBalancer;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, error, info};

tokio::task_local! {
    /// Present while a branch runs inside a load-balancer worker slot
    static HOLDING_WORKER_SLOT: ();
}

/// Upper bound on concurrent branches when no explicit limit is set
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 32;

/// Outcome of one fan-out
#[derive(Debug, Clone)]
pub struct ParallelRun {
    pub action: Action,
    /// Present when at least one branch failed
    pub error: Option<AggregateError>,
}

/// Aborts spawned branches if the fan-out itself is dropped
pub(crate) struct AbortOnDrop(pub(crate) Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

pub(crate) type BranchOutput = Result<(Action, SharedContext)>;

/// Runs several nodes concurrently on copies of the context
#[derive(Clone)]
pub struct ParallelFlow {
    name: String,
    branches: Vec<NodeRef>,
    max_concurrency: Option<usize>,
    global_limit: usize,
    balancer: Option<Arc<LoadBalancer>>,
    post: Option<PostHook>,
}

impl ParallelFlow {
    pub fn new(name: impl Into<String>, branches: Vec<NodeRef>) -> Self {
        Self {
            name: name.into(),
            branches,
            max_concurrency: None,
            global_limit: DEFAULT_GLOBAL_CONCURRENCY,
            balancer: None,
            post: None,
        }
    }

    /// Run at most `limit` branches at once
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Cap applied to the default limit (one slot per branch)
    pub fn with_global_limit(mut self, limit: usize) -> Self {
        self.global_limit = limit.max(1);
        self
    }

    /// Run each branch on one of the balancer's workers
    pub fn with_load_balancer(mut self, balancer: Arc<LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    /// Set the hook that maps the aggregate action to the flow's action
    pub fn with_post<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut SharedContext, Action) -> Result<Action> + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(hook));
        self
    }

    pub fn branches(&self) -> &[NodeRef] {
        &self.branches
    }

    /// Effective number of concurrently running branches
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrency
            .unwrap_or_else(|| self.branches.len().min(self.global_limit))
            .max(1)
    }

    /// Fan out, wait for every branch, merge and report failures
    pub async fn run_branches(&self, ctx: &mut SharedContext) -> Result<ParallelRun> {
        let snapshot = ctx.clone();
        let limit = self.concurrency_limit();
        let semaphore = Arc::new(Semaphore::new(limit));

        info!(flow = %self.name, branches = self.branches.len(), limit, "Fan-out started");

        let handles: Vec<_> = self
            .branches
            .iter()
            .map(|branch| {
                spawn_branch(
                    Arc::clone(branch),
                    snapshot.clone(),
                    Arc::clone(&semaphore),
                    self.balancer.clone(),
                )
            })
            .collect();
        let _abort = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        let outputs = join_all(handles).await;

        let mut failures = Vec::new();
        for (index, (branch, output)) in self.branches.iter().zip(outputs).enumerate() {
            let position = index + 1;
            match flatten(output) {
                Ok((action, copy)) => {
                    let mut changes = copy.diff(&snapshot);
                    if let Some(reported) = changes.remove(ERROR_KEY) {
                        let message = match reported {
                            serde_json::Value::String(message) => message,
                            other => other.to_string(),
                        };
                        failures.push(BranchFailure {
                            position,
                            name: branch.name().to_string(),
                            error: message,
                        });
                    }
                    debug!(flow = %self.name, branch = branch.name(), position, action = %action, keys = changes.len(), "Merging branch");
                    ctx.merge_changes(changes);
                }
                Err(err) => failures.push(BranchFailure {
                    position,
                    name: branch.name().to_string(),
                    error: err.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            info!(flow = %self.name, "Fan-out finished");
            return Ok(ParallelRun {
                action: DEFAULT_ACTION.to_string(),
                error: None,
            });
        }

        let aggregate = AggregateError::new(FailureScope::Branch, self.branches.len(), failures);
        error!(flow = %self.name, error = %aggregate, "Fan-out failed");
        ctx.set_error(aggregate.to_string());
        Ok(ParallelRun {
            action: ERROR_ACTION.to_string(),
            error: Some(aggregate),
        })
    }

    /// Fan out and return the flow's action
    pub async fn run(&self, ctx: &mut SharedContext) -> Result<Action> {
        let outcome = self.run_branches(ctx).await?;
        match &self.post {
            Some(hook) => hook(ctx, outcome.action),
            None => Ok(outcome.action),
        }
    }
}

/// Spawn a branch as its own task
///
/// A fan-out nested inside a branch that already holds a worker slot runs
/// its branches directly: waiting for a slot there could wait on the
/// enclosing branches' own slots. The marker is carried into the spawned
/// task so deeper fan-outs see it too.
pub(crate) fn spawn_branch(
    branch: NodeRef,
    ctx: SharedContext,
    semaphore: Arc<Semaphore>,
    balancer: Option<Arc<LoadBalancer>>,
) -> JoinHandle<BranchOutput> {
    if HOLDING_WORKER_SLOT.try_with(|_| ()).is_ok() {
        if balancer.is_some() {
            debug!(branch = branch.name(), "Nested fan-out inside a worker slot, bypassing balancer");
        }
        tokio::spawn(HOLDING_WORKER_SLOT.scope((), run_branch(branch, ctx, semaphore, None)))
    } else {
        tokio::spawn(run_branch(branch, ctx, semaphore, balancer))
    }
}

async fn run_branch(
    branch: NodeRef,
    mut ctx: SharedContext,
    semaphore: Arc<Semaphore>,
    balancer: Option<Arc<LoadBalancer>>,
) -> BranchOutput {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| FlowError::execution(e.to_string()))?;

    match balancer {
        Some(balancer) => {
            balancer
                .try_execute_task(
                    |mut ctx: SharedContext| {
                        HOLDING_WORKER_SLOT.scope((), async move {
                            let action = branch.run(&mut ctx).await?;
                            Ok::<_, FlowError>((action, ctx))
                        })
                    },
                    ctx,
                    None,
                )
                .await
                .map_err(FlowError::from)
        }
        None => {
            let action = branch.run(&mut ctx).await?;
            Ok((action, ctx))
        }
    }
}

pub(crate) fn flatten(output: std::result::Result<BranchOutput, JoinError>) -> BranchOutput {
    match output {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(FlowError::execution(format!("branch panicked: {}", err))),
        Err(err) => Err(FlowError::execution(format!("branch cancelled: {}", err))),
    }
}

impl fmt::Debug for ParallelFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.branches.iter().map(|b| b.name()).collect();
        f.debug_struct("ParallelFlow")
            .field("name", &self.name)
            .field("branches", &names)
            .field("limit", &self.concurrency_limit())
            .field("balanced", &self.balancer.is_some())
            .finish()
    }
}

#[async_trait]
impl Node for ParallelFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut SharedContext) -> Result<Action> {
        ParallelFlow::run(self, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FnNode;
    use flowline_runtime::BalancingStrategy;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn writer(name: &'static str, key: &'static str, value: i64, delay_ms: u64) -> NodeRef {
        FnNode::new(name)
            .with_exec(move |_| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(json!(value))
            })
            .with_post(move |ctx, _, exec| {
                ctx.insert(key, exec.unwrap_or_default());
                Ok(DEFAULT_ACTION.to_string())
            })
            .into_ref()
    }

    #[tokio::test]
    async fn test_later_branch_wins_regardless_of_completion_order() {
        let flow = ParallelFlow::new(
            "fan",
            vec![
                writer("slow_first", "shared", 1, 30),
                writer("fast_second", "shared", 2, 1),
            ],
        );

        let mut ctx = SharedContext::new();
        assert_eq!(flow.run(&mut ctx).await.unwrap(), DEFAULT_ACTION);
        assert_eq!(ctx.get_raw("shared"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_untouched_keys_are_not_clobbered() {
        let flow = ParallelFlow::new(
            "fan",
            vec![writer("a", "a", 1, 5), writer("b", "b", 2, 1)],
        );

        let mut ctx = SharedContext::new().with("a", 0).with("b", 0).with("c", 0);
        flow.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.get_raw("a"), Some(&json!(1)));
        assert_eq!(ctx.get_raw("b"), Some(&json!(2)));
        assert_eq!(ctx.get_raw("c"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_error_key_marks_branch_failed() {
        let reporter = FnNode::new("reporter")
            .with_post(|ctx, _, _| {
                ctx.insert("partial", true);
                ctx.set_error("quota exhausted");
                Ok(DEFAULT_ACTION.to_string())
            })
            .into_ref();
        let flow = ParallelFlow::new("fan", vec![writer("ok", "ok", 1, 1), reporter]);

        let mut ctx = SharedContext::new();
        let run = flow.run_branches(&mut ctx).await.unwrap();

        assert_eq!(run.action, ERROR_ACTION);
        assert_eq!(run.error.unwrap().positions(), vec![2]);
        assert_eq!(ctx.get_raw("partial"), Some(&json!(true)));
        assert_eq!(
            ctx.error().as_deref(),
            Some("1 of 2 branches failed; branch 2 ('reporter'): quota exhausted")
        );
    }

    #[tokio::test]
    async fn test_preexisting_error_is_not_a_branch_failure() {
        let flow = ParallelFlow::new("fan", vec![writer("a", "a", 1, 1)]);
        let mut ctx = SharedContext::new();
        ctx.set_error("earlier failure");

        assert_eq!(flow.run(&mut ctx).await.unwrap(), DEFAULT_ACTION);
        assert_eq!(ctx.error().as_deref(), Some("earlier failure"));
    }

    #[tokio::test]
    async fn test_panicking_branch_is_captured() {
        let panicking = FnNode::new("boom")
            .with_post(|_, _, _| panic!("branch exploded"))
            .into_ref();
        let flow = ParallelFlow::new("fan", vec![panicking, writer("ok", "ok", 7, 1)]);

        let mut ctx = SharedContext::new();
        let action = flow.run(&mut ctx).await.unwrap();

        assert_eq!(action, ERROR_ACTION);
        assert_eq!(ctx.get_raw("ok"), Some(&json!(7)));
        let message = ctx.error().unwrap();
        assert!(message.starts_with("1 of 2 branches failed; branch 1 ('boom'):"));
        assert!(message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let branches: Vec<NodeRef> = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                FnNode::new(format!("branch-{}", i))
                    .with_exec(move |v| {
                        let running = Arc::clone(&running);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(v)
                        }
                    })
                    .into_ref()
            })
            .collect();

        let flow = ParallelFlow::new("limited", branches).with_max_concurrency(2);
        flow.run(&mut SharedContext::new()).await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_default_limit_capped_by_global_limit() {
        let branches: Vec<NodeRef> = (0..5).map(|i| FnNode::new(format!("b{}", i)).into_ref()).collect();
        assert_eq!(ParallelFlow::new("p", branches.clone()).concurrency_limit(), 5);
        assert_eq!(
            ParallelFlow::new("p", branches.clone()).with_global_limit(3).concurrency_limit(),
            3
        );
        assert_eq!(ParallelFlow::new("p", vec![]).concurrency_limit(), 1);
    }

    #[tokio::test]
    async fn test_branches_through_load_balancer() {
        let balancer = Arc::new(LoadBalancer::new(2, BalancingStrategy::RoundRobin));
        let flow = ParallelFlow::new(
            "balanced",
            vec![
                writer("a", "a", 1, 2),
                writer("b", "b", 2, 2),
                writer("c", "c", 3, 2),
            ],
        )
        .with_load_balancer(Arc::clone(&balancer));

        let mut ctx = SharedContext::new();
        assert_eq!(flow.run(&mut ctx).await.unwrap(), DEFAULT_ACTION);
        assert_eq!(ctx.get_raw("c"), Some(&json!(3)));
        assert_eq!(balancer.report().total_completed, 3);
    }
}
