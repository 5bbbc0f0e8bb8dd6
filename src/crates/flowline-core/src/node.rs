//! The node contract
//!
//! A node is a unit of work with three phases:
//!
//! 1. `prep` reads what it needs from the [`SharedContext`]. A
//!    [`PreparationError`] here means the preconditions are not met and
//!    `exec` is skipped.
//! 2. `exec` does the work on the prepared value. It may fail; failures are
//!    retried per [`Node::retry_policy`] and then routed to
//!    [`Node::exec_fallback`], which by default logs and substitutes `null`.
//! 3. `post` writes results back into the context and returns the action
//!    that selects the next node in the enclosing flow.
//!
//! Nodes are created once and reused across runs, so implementations keep
//! per-run state in the context rather than in `self`.
//!
//! Blocking implementations implement [`SyncNode`] instead and are wrapped
//! in a [`BlockingNode`], which runs their `exec` on the blocking pool.

use crate::context::SharedContext;
use crate::error::{FlowError, PreparationError, Result};
use async_trait::async_trait;
use flowline_runtime::async_utils::{run_blocking, with_retry, RetryPolicy};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Transition label returned by `post`
pub type Action = String;

/// Action returned when a node does not choose one
pub const DEFAULT_ACTION: &str = "default";

/// Action taken by fan-out primitives when any branch failed
pub const ERROR_ACTION: &str = "error";

/// What `post` receives from the exec phase
///
/// `Err` carries the preparation failure when `exec` was skipped.
pub type ExecOutcome = std::result::Result<Value, PreparationError>;

/// Shared handle to a node in a graph
pub type NodeRef = Arc<dyn Node>;

/// Asynchronous unit of work
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    /// Read inputs from the context
    async fn prep(&self, _ctx: &SharedContext) -> std::result::Result<Value, PreparationError> {
        Ok(Value::Null)
    }

    /// Do the work
    async fn exec(&self, _input: Value) -> Result<Value> {
        Ok(Value::Null)
    }

    /// Called once `exec` has failed on every allowed attempt
    async fn exec_fallback(&self, _input: Value, error: FlowError) -> Result<Value> {
        warn!(node = self.name(), %error, "exec failed, substituting null result");
        Ok(Value::Null)
    }

    /// Write results back and choose the next action
    async fn post(
        &self,
        ctx: &mut SharedContext,
        _prep: &Value,
        exec: ExecOutcome,
    ) -> Result<Action> {
        Ok(default_post(ctx, exec))
    }

    /// Attempts allowed for `exec`
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::once()
    }

    /// Run the full lifecycle against `ctx`
    async fn run(&self, ctx: &mut SharedContext) -> Result<Action> {
        run_lifecycle(self, ctx).await
    }
}

/// Behavior of the default `post`: record a preparation failure, if any
pub fn default_post(ctx: &mut SharedContext, exec: ExecOutcome) -> Action {
    if let Err(error) = exec {
        ctx.set_error(error.to_string());
    }
    DEFAULT_ACTION.to_string()
}

/// prep, then exec with retries and fallback, then post
pub async fn run_lifecycle<N>(node: &N, ctx: &mut SharedContext) -> Result<Action>
where
    N: Node + ?Sized,
{
    let (prep, outcome) = match node.prep(ctx).await {
        Ok(prep) => {
            let result = exec_with_fallback(node, prep.clone()).await?;
            (prep, Ok(result))
        }
        Err(error) => {
            debug!(node = node.name(), %error, "Preparation failed, skipping exec");
            (Value::Null, Err(error))
        }
    };

    let action = node.post(ctx, &prep, outcome).await?;
    debug!(node = node.name(), action = %action, "Node finished");
    Ok(action)
}

async fn exec_with_fallback<N>(node: &N, input: Value) -> Result<Value>
where
    N: Node + ?Sized,
{
    let policy = node.retry_policy();
    match with_retry(&policy, |_| node.exec(input.clone())).await {
        Ok(value) => Ok(value),
        Err(error) => node.exec_fallback(input, error).await,
    }
}

type PrepFn = Arc<dyn Fn(&SharedContext) -> std::result::Result<Value, PreparationError> + Send + Sync>;
type ExecFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type PostFn = Arc<dyn Fn(&mut SharedContext, &Value, ExecOutcome) -> Result<Action> + Send + Sync>;

/// Node assembled from closures
///
/// Unset phases behave like the trait defaults, except that `exec` passes
/// its input through unchanged.
///
/// ```rust
/// use flowline_core::{FnNode, PreparationError, DEFAULT_ACTION};
/// use serde_json::json;
///
/// let node = FnNode::new("double")
///     .with_prep(|ctx| {
///         ctx.get_raw("n")
///             .cloned()
///             .ok_or_else(|| PreparationError::new("double", "n is missing"))
///     })
///     .with_exec(|n| async move { Ok(json!(n.as_i64().unwrap_or(0) * 2)) })
///     .with_post(|ctx, _, result| {
///         if let Ok(value) = result {
///             ctx.insert("doubled", value);
///         }
///         Ok(DEFAULT_ACTION.to_string())
///     });
/// ```
#[derive(Clone)]
pub struct FnNode {
    name: String,
    prep: Option<PrepFn>,
    exec: Option<ExecFn>,
    post: Option<PostFn>,
    retry: RetryPolicy,
}

impl FnNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prep: None,
            exec: None,
            post: None,
            retry: RetryPolicy::once(),
        }
    }

    pub fn with_prep<F>(mut self, f: F) -> Self
    where
        F: Fn(&SharedContext) -> std::result::Result<Value, PreparationError> + Send + Sync + 'static,
    {
        self.prep = Some(Arc::new(f));
        self
    }

    pub fn with_exec<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.exec = Some(Arc::new(move |input| -> BoxFuture<'static, Result<Value>> {
            Box::pin(f(input))
        }));
        self
    }

    pub fn with_post<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SharedContext, &Value, ExecOutcome) -> Result<Action> + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(f));
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Wrap into a shareable [`NodeRef`]
    pub fn into_ref(self) -> NodeRef {
        Arc::new(self)
    }
}

impl fmt::Debug for FnNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnNode")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish()
    }
}

#[async_trait]
impl Node for FnNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prep(&self, ctx: &SharedContext) -> std::result::Result<Value, PreparationError> {
        match &self.prep {
            Some(prep) => prep(ctx),
            None => Ok(Value::Null),
        }
    }

    async fn exec(&self, input: Value) -> Result<Value> {
        match &self.exec {
            Some(exec) => exec(input).await,
            None => Ok(input),
        }
    }

    async fn post(&self, ctx: &mut SharedContext, prep: &Value, exec: ExecOutcome) -> Result<Action> {
        match &self.post {
            Some(post) => post(ctx, prep, exec),
            None => Ok(default_post(ctx, exec)),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

/// Node whose phases block the calling thread
pub trait SyncNode: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn prep(&self, _ctx: &SharedContext) -> std::result::Result<Value, PreparationError> {
        Ok(Value::Null)
    }

    fn exec(&self, input: Value) -> Result<Value>;

    fn exec_fallback(&self, _input: Value, error: FlowError) -> Result<Value> {
        warn!(node = self.name(), %error, "exec failed, substituting null result");
        Ok(Value::Null)
    }

    fn post(&self, ctx: &mut SharedContext, _prep: &Value, exec: ExecOutcome) -> Result<Action> {
        Ok(default_post(ctx, exec))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::once()
    }
}

/// Runs a [`SyncNode`] inside an async flow
///
/// `prep` and `post` only touch the context and run inline; `exec` and
/// `exec_fallback` run on the blocking pool so they never hold up the
/// scheduler. A panic in either is reported as a [`FlowError::Runtime`].
pub struct BlockingNode<N> {
    inner: Arc<N>,
}

impl<N: SyncNode> BlockingNode<N> {
    pub fn new(node: N) -> Self {
        Self {
            inner: Arc::new(node),
        }
    }

    pub fn inner(&self) -> &N {
        &self.inner
    }
}

#[async_trait]
impl<N: SyncNode> Node for BlockingNode<N> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn prep(&self, ctx: &SharedContext) -> std::result::Result<Value, PreparationError> {
        self.inner.prep(ctx)
    }

    async fn exec(&self, input: Value) -> Result<Value> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.exec(input)).await?
    }

    async fn exec_fallback(&self, input: Value, error: FlowError) -> Result<Value> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.exec_fallback(input, error)).await?
    }

    async fn post(&self, ctx: &mut SharedContext, prep: &Value, exec: ExecOutcome) -> Result<Action> {
        self.inner.post(ctx, prep, exec)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }
}
