//! Fixed-size worker pool with pluggable task assignment
//!
//! Each logical worker owns a one-permit semaphore, so the pool never runs
//! more than `max_workers` tasks at once. A worker is chosen per task by the
//! configured [`BalancingStrategy`]; per-worker statistics live behind a
//! single lock and feed back into the next choice.
//!
//! A task's slot is released on every exit path (success, failure, timeout,
//! or the task future being dropped) before its statistics are updated.

use crate::async_utils::{run_blocking_fallible, with_optional_timeout, TimeoutError};
use crate::config::EngineConfig;
use crate::monitor::PerformanceMonitor;
use crate::{Result, RuntimeError};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How the next task's worker is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    /// Worker with the lowest load score
    #[default]
    LeastLoaded,
    /// Strict cyclic order, independent of load
    RoundRobin,
    /// Random draw weighted by recent speed and reliability
    Weighted,
}

impl BalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalancingStrategy::LeastLoaded => "least_loaded",
            BalancingStrategy::RoundRobin => "round_robin",
            BalancingStrategy::Weighted => "weighted",
        }
    }
}

impl fmt::Display for BalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalancingStrategy {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "least_loaded" => Ok(BalancingStrategy::LeastLoaded),
            "round_robin" => Ok(BalancingStrategy::RoundRobin),
            "weighted" => Ok(BalancingStrategy::Weighted),
            other => Err(RuntimeError::Configuration(format!(
                "Unknown balancing strategy '{}', expected least_loaded, round_robin or weighted",
                other
            ))),
        }
    }
}

/// Statistics for one logical worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    /// Tasks currently holding the worker's slot
    pub active_tasks: usize,
    /// Tasks assigned to the worker and waiting for its slot
    pub pending_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Mean execution time in seconds over all finished tasks
    pub avg_execution_time: f64,
    pub success_rate: f64,
    pub load_score: f64,
    #[serde(skip)]
    last_task_time: Option<Instant>,
}

impl WorkerStats {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            active_tasks: 0,
            pending_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            avg_execution_time: 0.0,
            success_rate: 1.0,
            load_score: 0.0,
            last_task_time: None,
        }
    }

    /// Finished tasks, successful or not
    pub fn total_tasks(&self) -> u64 {
        self.completed_tasks + self.failed_tasks
    }

    fn in_flight(&self) -> usize {
        self.active_tasks + self.pending_tasks
    }

    fn refresh_load_score(&mut self, now: Instant) {
        let recency = self
            .last_task_time
            .map(|at| (10.0 - now.saturating_duration_since(at).as_secs_f64()).max(0.0) / 10.0)
            .unwrap_or(0.0);

        self.load_score = self.in_flight() as f64
            + self.avg_execution_time / 10.0
            + (1.0 - self.success_rate) * 5.0
            + recency;
    }

    fn weight(&self) -> f64 {
        self.success_rate / (self.avg_execution_time + 1.0) / (self.in_flight() as f64 + 1.0)
    }

    fn record(&mut self, success: bool, elapsed: Duration) {
        if success {
            self.completed_tasks += 1;
        } else {
            self.failed_tasks += 1;
        }

        let total = self.total_tasks() as f64;
        self.avg_execution_time += (elapsed.as_secs_f64() - self.avg_execution_time) / total;
        self.success_rate = self.completed_tasks as f64 / total;
        self.last_task_time = Some(Instant::now());
    }
}

/// Pool-wide summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerReport {
    pub strategy: BalancingStrategy,
    pub total_workers: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub overall_success_rate: f64,
    pub workers: Vec<WorkerStats>,
}

#[derive(Debug)]
struct PoolState {
    workers: Vec<WorkerStats>,
    next_round_robin: usize,
}

/// Worker pool dispatching tasks by strategy
pub struct LoadBalancer {
    strategy: BalancingStrategy,
    slots: Vec<Semaphore>,
    state: Mutex<PoolState>,
    monitor: Option<Arc<PerformanceMonitor>>,
    default_timeout: Option<Duration>,
}

/// Tracks one task's claim on a worker from assignment to release
struct SlotGuard<'a> {
    balancer: &'a LoadBalancer,
    worker: usize,
    permit: Option<SemaphorePermit<'a>>,
    started: Option<Instant>,
    finished: bool,
}

impl<'a> SlotGuard<'a> {
    fn activate(&mut self, permit: SemaphorePermit<'a>) {
        let mut state = self.balancer.state.lock();
        let stats = &mut state.workers[self.worker];
        stats.pending_tasks -= 1;
        stats.active_tasks += 1;
        self.permit = Some(permit);
        self.started = Some(Instant::now());
    }

    fn finish(mut self, success: bool) {
        self.finished = true;
        self.release(Some(success));
    }

    fn release(&mut self, outcome: Option<bool>) {
        let mut state = self.balancer.state.lock();
        // The freed permit cannot be claimed by the next task until this lock
        // is released, so active_tasks never overshoots the pool size.
        let held = self.permit.take();
        drop(held);

        let stats = &mut state.workers[self.worker];
        match self.started {
            Some(started) => {
                stats.active_tasks -= 1;
                let elapsed = started.elapsed();
                stats.record(outcome.unwrap_or(false), elapsed);
            }
            None => stats.pending_tasks -= 1,
        }
        stats.refresh_load_score(Instant::now());
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if self.started.is_some() {
                debug!(worker = self.worker, "Task dropped mid-flight, recording failure");
            }
            self.release(None);
        }
    }
}

impl LoadBalancer {
    /// Create a pool of `max_workers` workers (at least one)
    pub fn new(max_workers: usize, strategy: BalancingStrategy) -> Self {
        let max_workers = max_workers.max(1);

        Self {
            strategy,
            slots: (0..max_workers).map(|_| Semaphore::new(1)).collect(),
            state: Mutex::new(PoolState {
                workers: (0..max_workers).map(WorkerStats::new).collect(),
                next_round_robin: 0,
            }),
            monitor: None,
            default_timeout: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let balancer = Self::new(config.max_workers, config.balancing_strategy);
        match config.task_timeout() {
            Some(limit) => balancer.with_default_timeout(limit),
            None => balancer,
        }
    }

    /// Deadline applied to tasks submitted without their own
    pub fn with_default_timeout(mut self, limit: Duration) -> Self {
        self.default_timeout = Some(limit);
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Report every task to `monitor`
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    pub fn max_workers(&self) -> usize {
        self.slots.len()
    }

    /// Run `f(arg)` on a selected worker
    ///
    /// Returns `None` when the function fails or exceeds `timeout`; both are
    /// recorded as failures against the worker. Without a `timeout` the
    /// balancer's default deadline, if any, applies.
    pub async fn execute_task<F, Fut, A, T, E>(
        &self,
        f: F,
        arg: A,
        timeout: Option<Duration>,
    ) -> Option<T>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        self.try_execute_task(f, arg, timeout).await.ok()
    }

    /// Like [`execute_task`](Self::execute_task) but keeps the failure
    ///
    /// A timeout surfaces as [`RuntimeError::Timeout`] and a failed function
    /// as [`RuntimeError::TaskFailed`].
    pub async fn try_execute_task<F, Fut, A, T, E>(
        &self,
        f: F,
        arg: A,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let worker = self.select_worker();
        let mut slot = SlotGuard {
            balancer: self,
            worker,
            permit: None,
            started: None,
            finished: false,
        };

        let permit = self.slots[worker]
            .acquire()
            .await
            .map_err(|e| RuntimeError::TaskFailed(format!("worker {} unavailable: {}", worker, e)))?;
        slot.activate(permit);

        let task = self
            .monitor
            .as_ref()
            .map(|monitor| monitor.start_task(format!("worker-{}", worker)));

        let result = with_optional_timeout(timeout.or(self.default_timeout), f(arg)).await;

        let result: Result<T> = match result {
            Ok(value) => Ok(value),
            Err(err @ TimeoutError::Elapsed(_)) => {
                warn!(worker, error = %err, "Task timed out");
                Err(err.into())
            }
            Err(err) => {
                debug!(worker, error = %err, "Task failed");
                Err(err.into())
            }
        };

        slot.finish(result.is_ok());
        if let Some(task) = task {
            match &result {
                Ok(_) => task.complete(),
                Err(error) => task.fail(error.to_string()),
            }
        }
        result
    }

    /// Run a blocking `f(arg)` on a selected worker, off the scheduler thread
    ///
    /// On timeout the slot is released immediately; the blocking thread
    /// itself runs to completion in the background.
    pub async fn execute_task_blocking<F, A, T, E>(
        &self,
        f: F,
        arg: A,
        timeout: Option<Duration>,
    ) -> Option<T>
    where
        F: FnOnce(A) -> std::result::Result<T, E> + Send + 'static,
        A: Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.execute_task(
            |arg| run_blocking_fallible(move || f(arg)),
            arg,
            timeout,
        )
        .await
    }

    /// Run `f` over every argument concurrently
    ///
    /// The result has one entry per argument in input order; failed or timed
    /// out tasks are `None`.
    pub async fn execute_batch<F, Fut, A, T, E>(
        &self,
        f: F,
        args: Vec<A>,
        timeout: Option<Duration>,
    ) -> Vec<Option<T>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let f = &f;
        join_all(
            args.into_iter()
                .map(|arg| self.execute_task(f, arg, timeout)),
        )
        .await
    }

    /// Blocking counterpart of [`execute_batch`](Self::execute_batch)
    pub async fn execute_batch_blocking<F, A, T, E>(
        &self,
        f: F,
        args: Vec<A>,
        timeout: Option<Duration>,
    ) -> Vec<Option<T>>
    where
        F: Fn(A) -> std::result::Result<T, E> + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let f = Arc::new(f);
        join_all(args.into_iter().map(|arg| {
            let f = Arc::clone(&f);
            self.execute_task_blocking(move |arg| f(arg), arg, timeout)
        }))
        .await
    }

    /// Current per-worker statistics with fresh load scores
    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        let mut state = self.state.lock();
        let now = Instant::now();
        for stats in state.workers.iter_mut() {
            stats.refresh_load_score(now);
        }
        state.workers.clone()
    }

    pub fn report(&self) -> BalancerReport {
        let workers = self.worker_stats();
        let total_completed: u64 = workers.iter().map(|w| w.completed_tasks).sum();
        let total_failed: u64 = workers.iter().map(|w| w.failed_tasks).sum();
        let total = total_completed + total_failed;

        BalancerReport {
            strategy: self.strategy,
            total_workers: workers.len(),
            total_completed,
            total_failed,
            overall_success_rate: if total > 0 {
                total_completed as f64 / total as f64
            } else {
                1.0
            },
            workers,
        }
    }

    /// Pick a worker and mark the task pending on it
    fn select_worker(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.workers.len();

        let worker = match self.strategy {
            BalancingStrategy::RoundRobin => {
                let worker = state.next_round_robin % count;
                state.next_round_robin = state.next_round_robin.wrapping_add(1);
                worker
            }
            BalancingStrategy::LeastLoaded => {
                let now = Instant::now();
                for stats in state.workers.iter_mut() {
                    stats.refresh_load_score(now);
                }
                state
                    .workers
                    .iter()
                    .min_by(|a, b| a.load_score.total_cmp(&b.load_score))
                    .map(|stats| stats.worker_id)
                    .unwrap_or(0)
            }
            BalancingStrategy::Weighted => {
                let weights: Vec<f64> = state.workers.iter().map(WorkerStats::weight).collect();
                let mut rng = thread_rng();
                match WeightedIndex::new(&weights) {
                    Ok(dist) => dist.sample(&mut rng),
                    Err(_) => rng.gen_range(0..count),
                }
            }
        };

        state.workers[worker].pending_tasks += 1;
        debug!(worker, strategy = %self.strategy, "Selected worker");
        worker
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy)
            .field("max_workers", &self.slots.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok_task(x: u32) -> std::result::Result<u32, String> {
        Ok(x * 2)
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("least_loaded".parse::<BalancingStrategy>().unwrap(), BalancingStrategy::LeastLoaded);
        assert_eq!(" Round_Robin ".parse::<BalancingStrategy>().unwrap(), BalancingStrategy::RoundRobin);
        assert_eq!("weighted".parse::<BalancingStrategy>().unwrap(), BalancingStrategy::Weighted);
        assert!("fastest".parse::<BalancingStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&BalancingStrategy::RoundRobin).unwrap();
        assert_eq!(json, "\"round_robin\"");
        let parsed: BalancingStrategy = serde_json::from_str("\"least_loaded\"").unwrap();
        assert_eq!(parsed, BalancingStrategy::LeastLoaded);
    }

    #[test]
    fn test_load_score_terms() {
        let mut stats = WorkerStats::new(0);
        let now = Instant::now();
        stats.refresh_load_score(now);
        assert_eq!(stats.load_score, 0.0);

        stats.active_tasks = 2;
        stats.avg_execution_time = 5.0;
        stats.success_rate = 0.8;
        stats.refresh_load_score(now);
        assert!((stats.load_score - (2.0 + 0.5 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_record_updates_rates() {
        let mut stats = WorkerStats::new(0);
        stats.record(true, Duration::from_secs(2));
        stats.record(false, Duration::from_secs(4));

        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.failed_tasks, 1);
        assert!((stats.avg_execution_time - 3.0).abs() < 1e-9);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_execute_task_success_and_failure() {
        let balancer = LoadBalancer::new(2, BalancingStrategy::LeastLoaded);

        assert_eq!(balancer.execute_task(ok_task, 21, None).await, Some(42));
        let failed = balancer
            .execute_task(|_: u32| async { Err::<u32, _>("boom") }, 1, None)
            .await;
        assert_eq!(failed, None);

        let report = balancer.report();
        assert_eq!(report.total_completed, 1);
        assert_eq!(report.total_failed, 1);
        assert!(report.workers.iter().all(|w| w.active_tasks == 0 && w.pending_tasks == 0));
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let balancer = LoadBalancer::new(3, BalancingStrategy::RoundRobin);

        for i in 0..7u32 {
            let before = balancer.worker_stats();
            balancer.execute_task(ok_task, i, None).await;
            let after = balancer.worker_stats();

            let chosen = (0..3)
                .find(|&w| after[w].completed_tasks > before[w].completed_tasks)
                .unwrap();
            assert_eq!(chosen, i as usize % 3);
        }
    }

    #[tokio::test]
    async fn test_least_loaded_spreads_concurrent_batch() {
        let balancer = LoadBalancer::new(4, BalancingStrategy::LeastLoaded);
        let results = balancer
            .execute_batch(
                |x: u32| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, String>(x)
                },
                (0..4).collect(),
                None,
            )
            .await;

        assert_eq!(results, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert!(balancer.worker_stats().iter().all(|w| w.completed_tasks == 1));
    }

    #[tokio::test]
    async fn test_weighted_zero_weights_still_selects() {
        let balancer = LoadBalancer::new(3, BalancingStrategy::Weighted);
        {
            let mut state = balancer.state.lock();
            for stats in state.workers.iter_mut() {
                stats.success_rate = 0.0;
            }
        }
        assert_eq!(balancer.execute_task(ok_task, 1, None).await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let balancer = LoadBalancer::new(1, BalancingStrategy::RoundRobin);

        let slow = balancer
            .execute_task(
                |_: ()| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, String>(())
                },
                (),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert_eq!(slow, None);

        let next = tokio::time::timeout(
            Duration::from_millis(1),
            balancer.execute_task(ok_task, 5, None),
        )
        .await;
        assert_eq!(next.unwrap(), Some(10));

        let stats = &balancer.worker_stats()[0];
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
    }

    #[tokio::test]
    async fn test_dropped_task_releases_slot() {
        let balancer = LoadBalancer::new(1, BalancingStrategy::RoundRobin);

        let dropped = tokio::time::timeout(
            Duration::from_millis(10),
            balancer.execute_task(
                |_: ()| async {
                    futures::future::pending::<()>().await;
                    Ok::<_, String>(())
                },
                (),
                None,
            ),
        )
        .await;
        assert!(dropped.is_err());

        assert_eq!(balancer.execute_task(ok_task, 1, None).await, Some(2));
        let stats = &balancer.worker_stats()[0];
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_blocking_batch() {
        let balancer = LoadBalancer::new(2, BalancingStrategy::LeastLoaded);
        let results = balancer
            .execute_batch_blocking(
                |x: u64| {
                    std::thread::sleep(Duration::from_millis(2));
                    if x == 2 {
                        Err("bad input")
                    } else {
                        Ok(x + 1)
                    }
                },
                vec![0, 1, 2, 3],
                None,
            )
            .await;

        assert_eq!(results, vec![Some(1), Some(2), None, Some(4)]);
        assert_eq!(balancer.report().total_failed, 1);
    }

    #[test]
    fn test_zero_workers_clamped() {
        assert_eq!(LoadBalancer::new(0, BalancingStrategy::Weighted).max_workers(), 1);
    }
}
