//! Batch fan-out
//!
//! [`ParallelBatchFlow`] runs one template node (usually a [`Flow`](crate::Flow))
//! once per parameter set. Instances run concurrently and never cancel each
//! other: every instance produces exactly one [`BatchItemResult`], in input
//! order, whether it succeeded, failed, or panicked.
//!
//! [`ParallelBatchNode`] is the lighter-weight variant for per-item work that
//! does not need its own context: items go through a shared
//! [`ConcurrencyManager`], so they get adaptive chunking and the circuit
//! breaker for free.

use crate::context::{ContextChanges, Params, SharedContext, ERROR_KEY};
use crate::error::{AggregateError, BranchFailure, FailureScope, FlowError, PreparationError, Result};
use crate::flow::PostHook;
use crate::node::{default_post, Action, ExecOutcome, Node, NodeRef, DEFAULT_ACTION, ERROR_ACTION};
use crate::parallel::{flatten, spawn_branch, AbortOnDrop};
use async_trait::async_trait;
use flowline_runtime::ConcurrencyManager;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Context key the per-instance results are written to by default
pub const DEFAULT_RESULTS_KEY: &str = "batch_results";

type ParamsFn = Arc<dyn Fn(&SharedContext) -> std::result::Result<Vec<Params>, PreparationError> + Send + Sync>;

/// Outcome of one batch instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemResult {
    /// The instance finished without reporting an error
    Success {
        action: Action,
        /// Keys the instance added or changed
        updates: ContextChanges,
    },
    /// The instance returned an error, panicked, or set the `error` key
    Failure { error: String },
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchItemResult::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

/// Outcome of a whole batch
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub action: Action,
    /// One entry per parameter set, in input order
    pub results: Vec<BatchItemResult>,
    /// Present when at least one instance failed
    pub error: Option<AggregateError>,
}

impl BatchRun {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_failure()).count()
    }
}

/// Runs a template node once per parameter set
///
/// ```rust,ignore
/// let per_file = ParallelBatchFlow::new("summarize_all", summarize_flow, |ctx| {
///     let files: Vec<String> = ctx
///         .get(FILES)
///         .map_err(|e| PreparationError::new("summarize_all", e.to_string()))?
///         .unwrap_or_default();
///     Ok(files
///         .into_iter()
///         .map(|f| Params::from([("file".to_string(), json!(f))]))
///         .collect())
/// })
/// .with_max_concurrency(4);
/// ```
#[derive(Clone)]
pub struct ParallelBatchFlow {
    name: String,
    template: NodeRef,
    params_fn: ParamsFn,
    max_concurrency: Option<usize>,
    results_key: String,
    post: Option<PostHook>,
}

impl ParallelBatchFlow {
    pub fn new<F>(name: impl Into<String>, template: NodeRef, params_fn: F) -> Self
    where
        F: Fn(&SharedContext) -> std::result::Result<Vec<Params>, PreparationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            template,
            params_fn: Arc::new(params_fn),
            max_concurrency: None,
            results_key: DEFAULT_RESULTS_KEY.to_string(),
            post: None,
        }
    }

    /// Run at most `limit` instances at once (default: all of them)
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    pub fn with_results_key(mut self, key: impl Into<String>) -> Self {
        self.results_key = key.into();
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

    pub fn template(&self) -> &NodeRef {
        &self.template
    }

    pub fn results_key(&self) -> &str {
        &self.results_key
    }

    /// Run every instance and merge the successful ones
    ///
    /// Never returns an instance's error; failures land in the results list
    /// and in the aggregate recorded under the `error` key.
    pub async fn run_batch(&self, ctx: &mut SharedContext) -> Result<BatchRun> {
        let param_sets = match (self.params_fn)(ctx) {
            Ok(param_sets) => param_sets,
            Err(err) => {
                warn!(flow = %self.name, error = %err, "Batch preparation failed, no instances run");
                ctx.set_error(err.to_string());
                let action = self.apply_post(ctx, ERROR_ACTION.to_string())?;
                return Ok(BatchRun {
                    action,
                    results: Vec::new(),
                    error: None,
                });
            }
        };

        let total = param_sets.len();
        let limit = self.max_concurrency.unwrap_or(total).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let snapshot = ctx.clone();

        info!(flow = %self.name, instances = total, limit, "Batch started");

        let handles: Vec<_> = param_sets
            .into_iter()
            .map(|params| {
                spawn_branch(
                    Arc::clone(&self.template),
                    snapshot.clone().with_params(params),
                    Arc::clone(&semaphore),
                    None,
                )
            })
            .collect();
        let _abort = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        let outputs = join_all(handles).await;

        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, output) in outputs.into_iter().enumerate() {
            let position = index + 1;
            let result = match flatten(output) {
                Ok((action, copy)) => {
                    let mut updates = copy.diff(&snapshot);
                    match updates.remove(ERROR_KEY) {
                        Some(reported) => BatchItemResult::Failure {
                            error: match reported {
                                Value::String(message) => message,
                                other => other.to_string(),
                            },
                        },
                        None => BatchItemResult::Success { action, updates },
                    }
                }
                Err(err) => BatchItemResult::Failure {
                    error: err.to_string(),
                },
            };

            match &result {
                BatchItemResult::Success { updates, .. } => {
                    debug!(flow = %self.name, position, keys = updates.len(), "Merging instance");
                    ctx.merge_changes(updates.clone());
                }
                BatchItemResult::Failure { error } => {
                    debug!(flow = %self.name, position, %error, "Instance failed");
                    failures.push(BranchFailure {
                        position,
                        name: self.template.name().to_string(),
                        error: error.clone(),
                    });
                }
            }
            results.push(result);
        }

        ctx.insert(self.results_key.clone(), serde_json::to_value(&results)?);

        let (action, aggregate) = if failures.is_empty() {
            info!(flow = %self.name, instances = total, "Batch finished");
            (DEFAULT_ACTION.to_string(), None)
        } else {
            let aggregate = AggregateError::new(FailureScope::Item, total, failures);
            error!(flow = %self.name, error = %aggregate, "Batch failed");
            ctx.set_error(aggregate.to_string());
            (ERROR_ACTION.to_string(), Some(aggregate))
        };

        Ok(BatchRun {
            action: self.apply_post(ctx, action)?,
            results,
            error: aggregate,
        })
    }

    fn apply_post(&self, ctx: &mut SharedContext, action: Action) -> Result<Action> {
        match &self.post {
            Some(hook) => hook(ctx, action),
            None => Ok(action),
        }
    }
}

impl fmt::Debug for ParallelBatchFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelBatchFlow")
            .field("name", &self.name)
            .field("template", &self.template.name())
            .field("max_concurrency", &self.max_concurrency)
            .field("results_key", &self.results_key)
            .finish()
    }
}

#[async_trait]
impl Node for ParallelBatchFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut SharedContext) -> Result<Action> {
        Ok(self.run_batch(ctx).await?.action)
    }
}

type ItemsFn = Arc<dyn Fn(&SharedContext) -> std::result::Result<Vec<Value>, PreparationError> + Send + Sync>;
type ItemFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type ResultsFn = Arc<dyn Fn(&mut SharedContext, Vec<Option<Value>>) -> Result<Action> + Send + Sync>;

/// Node that maps a list of items through a [`ConcurrencyManager`]
///
/// `prep` yields the items, each item is processed by the item function,
/// and `post` receives the results by position with `None` for every item
/// that failed or was rejected by the breaker. Without a results hook the
/// list is stored under the results key (failures as `null`).
#[derive(Clone)]
pub struct ParallelBatchNode {
    name: String,
    manager: Arc<ConcurrencyManager>,
    items: ItemsFn,
    item: ItemFn,
    on_results: Option<ResultsFn>,
    max_concurrency: Option<usize>,
    results_key: String,
}

impl ParallelBatchNode {
    pub fn new<P, F, Fut>(name: impl Into<String>, manager: Arc<ConcurrencyManager>, items: P, item: F) -> Self
    where
        P: Fn(&SharedContext) -> std::result::Result<Vec<Value>, PreparationError> + Send + Sync + 'static,
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            manager,
            items: Arc::new(items),
            item: Arc::new(move |value| -> BoxFuture<'static, Result<Value>> { Box::pin(item(value)) }),
            on_results: None,
            max_concurrency: None,
            results_key: DEFAULT_RESULTS_KEY.to_string(),
        }
    }

    /// Override the manager's default concurrency for this node
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    pub fn with_results_key(mut self, key: impl Into<String>) -> Self {
        self.results_key = key.into();
        self
    }

    /// Handle the positional results instead of storing them
    pub fn with_post<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut SharedContext, Vec<Option<Value>>) -> Result<Action> + Send + Sync + 'static,
    {
        self.on_results = Some(Arc::new(hook));
        self
    }

    pub fn into_ref(self) -> NodeRef {
        Arc::new(self)
    }
}

impl fmt::Debug for ParallelBatchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelBatchNode")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .field("results_key", &self.results_key)
            .finish()
    }
}

#[async_trait]
impl Node for ParallelBatchNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prep(&self, ctx: &SharedContext) -> std::result::Result<Value, PreparationError> {
        (self.items)(ctx).map(Value::Array)
    }

    async fn exec(&self, input: Value) -> Result<Value> {
        let items = match input {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let count = items.len();

        let item = Arc::clone(&self.item);
        let results = self
            .manager
            .process_batch(items, move |value| item(value), self.max_concurrency)
            .await;

        let failed = results.iter().filter(|r| r.is_none()).count();
        debug!(node = %self.name, items = count, failed, "Batch node processed items");
        Ok(Value::Array(
            results.into_iter().map(|r| r.unwrap_or(Value::Null)).collect(),
        ))
    }

    async fn post(&self, ctx: &mut SharedContext, _prep: &Value, exec: ExecOutcome) -> Result<Action> {
        let values = match exec {
            Ok(Value::Array(values)) => values,
            Ok(Value::Null) => Vec::new(),
            Ok(other) => {
                return Err(FlowError::task_execution(
                    &self.name,
                    format!("expected a list of results, got {}", other),
                ))
            }
            Err(prep) => return Ok(default_post(ctx, Err(prep))),
        };

        match &self.on_results {
            Some(hook) => {
                let results = values
                    .into_iter()
                    .map(|v| if v.is_null() { None } else { Some(v) })
                    .collect();
                hook(ctx, results)
            }
            None => {
                ctx.insert(self.results_key.clone(), Value::Array(values));
                Ok(DEFAULT_ACTION.to_string())
            }
        }
    }
}
