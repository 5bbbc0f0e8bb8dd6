//! Bounded, adaptively-chunked batch execution
//!
//! [`ConcurrencyManager::process_batch`] splits its input into chunks sized by
//! the [`AdaptiveBatchProcessor`], runs every item of a chunk concurrently
//! under a counting semaphore, and guards each call with the manager's
//! [`CircuitBreaker`]. A failing item yields `None` at its position and never
//! aborts the chunk, so the output always lines up with the input.

use crate::adaptive_batch::AdaptiveBatchProcessor;
use crate::async_utils::run_blocking_fallible;
use crate::circuit_breaker::{CallOutcome, CircuitBreaker, CircuitState};
use crate::config::EngineConfig;
use crate::logging::timed;
use crate::monitor::PerformanceMonitor;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Running totals for a manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyStats {
    /// Items handed to the function or rejected by the breaker
    pub total_processed: u64,
    /// Items whose call ran and failed
    pub total_failed: u64,
    /// Items rejected by an open circuit without running
    pub total_rejected: u64,
    pub batches_processed: u64,
    /// Mean wall time per chunk, in seconds
    pub avg_execution_time: f64,
    /// Items per second since the manager was created
    pub throughput: f64,
    pub current_batch_size: usize,
    pub circuit_state: CircuitState,
}

#[derive(Debug, Default)]
struct RunningTotals {
    total_processed: u64,
    total_failed: u64,
    total_rejected: u64,
    batches_processed: u64,
    avg_execution_time: f64,
}

enum ItemOutcome<T> {
    Done(T),
    Failed,
    Rejected,
}

/// Runs batches of fallible calls with bounded concurrency
pub struct ConcurrencyManager {
    max_concurrent_calls: usize,
    adaptive: bool,
    fixed_batch_size: usize,
    batcher: Mutex<AdaptiveBatchProcessor>,
    breaker: CircuitBreaker,
    monitor: Option<Arc<PerformanceMonitor>>,
    totals: Mutex<RunningTotals>,
    created: Instant,
}

impl ConcurrencyManager {
    pub fn from_config(config: &EngineConfig) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker_threshold, config.recovery_timeout())
            .with_name("concurrency");

        Self {
            max_concurrent_calls: config.max_concurrent_calls.max(1),
            adaptive: config.adaptive_batch_size,
            fixed_batch_size: config.batch_size.max(1),
            batcher: Mutex::new(AdaptiveBatchProcessor::new(
                config.batch_size,
                config.min_batch_size,
                config.max_batch_size,
            )),
            breaker,
            monitor: None,
            totals: Mutex::new(RunningTotals::default()),
            created: Instant::now(),
        }
    }

    /// Track every item with `monitor`
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }

    /// Size of the next chunk
    pub fn current_batch_size(&self) -> usize {
        if self.adaptive {
            self.batcher.lock().current_batch_size()
        } else {
            self.fixed_batch_size
        }
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let totals = self.totals.lock();
        let uptime = self.created.elapsed().as_secs_f64();

        ConcurrencyStats {
            total_processed: totals.total_processed,
            total_failed: totals.total_failed,
            total_rejected: totals.total_rejected,
            batches_processed: totals.batches_processed,
            avg_execution_time: totals.avg_execution_time,
            throughput: if uptime > 0.0 {
                totals.total_processed as f64 / uptime
            } else {
                0.0
            },
            current_batch_size: self.current_batch_size(),
            circuit_state: self.breaker.state(),
        }
    }

    /// Apply `f` to every item
    ///
    /// At most `max_concurrency` calls (default: `max_concurrent_calls`) run
    /// at once. The result has one entry per item in input order; items whose
    /// call failed or was rejected by the breaker are `None`.
    pub async fn process_batch<I, F, Fut, T, E>(
        &self,
        items: Vec<I>,
        f: F,
        max_concurrency: Option<usize>,
    ) -> Vec<Option<T>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let limit = max_concurrency.unwrap_or(self.max_concurrent_calls).max(1);
        let semaphore = Semaphore::new(limit);
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut remaining = items.into_iter().peekable();

        while remaining.peek().is_some() {
            let chunk: Vec<I> = remaining.by_ref().take(self.current_batch_size()).collect();
            let chunk_len = chunk.len();
            let started = Instant::now();

            let outcomes = timed(
                "batch_chunk",
                join_all(
                    chunk
                        .into_iter()
                        .map(|item| self.run_item(&semaphore, &f, item)),
                ),
            )
            .await;

            let elapsed = started.elapsed();
            let mut succeeded = 0;
            let mut failed = 0;
            let mut rejected = 0;
            for outcome in outcomes {
                match outcome {
                    ItemOutcome::Done(value) => {
                        succeeded += 1;
                        results.push(Some(value));
                    }
                    ItemOutcome::Failed => {
                        failed += 1;
                        results.push(None);
                    }
                    ItemOutcome::Rejected => {
                        rejected += 1;
                        results.push(None);
                    }
                }
            }

            self.record_chunk(chunk_len, succeeded, failed, rejected, elapsed);
        }

        debug!(items = total, concurrency = limit, "Batch processed");
        results
    }

    /// Apply a blocking `f` to every item, each call on the blocking pool
    pub async fn process_batch_blocking<I, F, T, E>(
        &self,
        items: Vec<I>,
        f: F,
        max_concurrency: Option<usize>,
    ) -> Vec<Option<T>>
    where
        I: Send + 'static,
        F: Fn(I) -> Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let f = Arc::new(f);
        self.process_batch(
            items,
            |item| {
                let f = Arc::clone(&f);
                run_blocking_fallible(move || f(item))
            },
            max_concurrency,
        )
        .await
    }

    async fn run_item<I, F, Fut, T, E>(&self, semaphore: &Semaphore, f: &F, item: I) -> ItemOutcome<T>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        // The semaphore is local to this call and never closed
        let Ok(_permit) = semaphore.acquire().await else {
            return ItemOutcome::Failed;
        };
        let task = self
            .monitor
            .as_deref()
            .map(|monitor| monitor.start_task("batch-item"));

        match self.breaker.call(|| f(item)).await {
            CallOutcome::Ok(value) => {
                if let Some(task) = task {
                    task.complete();
                }
                ItemOutcome::Done(value)
            }
            CallOutcome::Failed(error) => {
                debug!(%error, "Batch item failed");
                if let Some(task) = task {
                    task.fail(error.to_string());
                }
                ItemOutcome::Failed
            }
            CallOutcome::CircuitOpen => {
                if let Some(task) = task {
                    task.fail("circuit open");
                }
                ItemOutcome::Rejected
            }
        }
    }

    fn record_chunk(
        &self,
        size: usize,
        succeeded: usize,
        failed: usize,
        rejected: usize,
        elapsed: Duration,
    ) {
        {
            let mut totals = self.totals.lock();
            totals.total_processed += size as u64;
            totals.total_failed += failed as u64;
            totals.total_rejected += rejected as u64;
            totals.batches_processed += 1;
            let n = totals.batches_processed as f64;
            totals.avg_execution_time += (elapsed.as_secs_f64() - totals.avg_execution_time) / n;
        }

        if rejected > 0 {
            warn!(rejected, "Circuit open, batch items rejected");
        }

        if self.adaptive && size > 0 {
            let success_rate = succeeded as f64 / size as f64;
            let mut batcher = self.batcher.lock();
            let previous = batcher.current_batch_size();
            let next = batcher.record_batch(size, elapsed, success_rate);
            if next != previous {
                info!(from = previous, to = next, success_rate, "Batch size adapted");
            }
        }
    }
}

impl fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("adaptive", &self.adaptive)
            .field("current_batch_size", &self.current_batch_size())
            .field("breaker", &self.breaker)
            .finish()
    }
}
