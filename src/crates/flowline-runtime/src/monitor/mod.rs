//! Asynchronous performance monitoring
//!
//! [`PerformanceMonitor`] observes work without interfering with it: scoped
//! task tracking records start, end and outcome of each unit of work, and a
//! background loop periodically samples process resource usage together with
//! derived task metrics into a bounded history.
//!
//! ```rust,ignore
//! let monitor = Arc::new(PerformanceMonitor::new(Duration::from_secs(1), 100));
//! monitor.start_monitoring()?;
//!
//! let summary = monitor.track("summarize", call_remote(chunk)).await?;
//!
//! monitor.stop_monitoring().await?;
//! println!("{}", monitor.report());
//! ```

mod metrics;
mod system;

pub use metrics::{PerformanceMetrics, PerformanceReport, TaskMetrics};
pub use system::{ProcessSample, ProcessSampler};

use crate::config::EngineConfig;
use crate::{Result, RuntimeError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on the finished-task history
pub const COMPLETED_TASK_CAPACITY: usize = 1000;

/// Finished tasks considered for the average latency
const LATENCY_WINDOW: usize = 100;

struct TaskRecord {
    metrics: TaskMetrics,
    started: Instant,
}

#[derive(Default)]
struct MonitorState {
    active: HashMap<Uuid, TaskRecord>,
    completed: VecDeque<TaskMetrics>,
    total_completed: u64,
    total_failed: u64,
    peak_active: usize,
    history: VecDeque<PerformanceMetrics>,
}

struct MonitorShared {
    history_size: usize,
    created: Instant,
    state: Mutex<MonitorState>,
    sampler: Mutex<ProcessSampler>,
}

impl MonitorShared {
    fn snapshot(&self) -> PerformanceMetrics {
        let process = self.sampler.lock().sample();
        let uptime = self.created.elapsed().as_secs_f64();
        let state = self.state.lock();

        let finished = state.total_completed + state.total_failed;
        let recent: Vec<Duration> = state
            .completed
            .iter()
            .rev()
            .take(LATENCY_WINDOW)
            .filter_map(|task| task.duration)
            .collect();
        let avg_latency = if recent.is_empty() {
            Duration::ZERO
        } else {
            recent.iter().sum::<Duration>() / recent.len() as u32
        };

        PerformanceMetrics {
            timestamp: Utc::now(),
            cpu_percent: process.cpu_percent,
            memory_bytes: process.memory_bytes,
            active_tasks: state.active.len(),
            completed_tasks: state.total_completed,
            failed_tasks: state.total_failed,
            avg_latency,
            throughput: if uptime > 0.0 {
                finished as f64 / uptime
            } else {
                0.0
            },
            error_rate: if finished > 0 {
                state.total_failed as f64 / finished as f64
            } else {
                0.0
            },
        }
    }

    fn record_sample(&self) -> PerformanceMetrics {
        let metrics = self.snapshot();
        let mut state = self.state.lock();
        if state.history.len() >= self.history_size {
            state.history.pop_front();
        }
        state.history.push_back(metrics.clone());
        metrics
    }
}

struct MonitorLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Collects task and process metrics
pub struct PerformanceMonitor {
    interval: Duration,
    shared: Arc<MonitorShared>,
    running: Mutex<Option<MonitorLoop>>,
}

impl PerformanceMonitor {
    /// Create a monitor sampling every `interval`, keeping `history_size`
    /// snapshots
    pub fn new(interval: Duration, history_size: usize) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            shared: Arc::new(MonitorShared {
                history_size: history_size.max(1),
                created: Instant::now(),
                state: Mutex::new(MonitorState::default()),
                sampler: Mutex::new(ProcessSampler::new()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.monitoring_interval(), config.history_size)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the sampling loop on the current tokio runtime
    ///
    /// Calling it while the loop is already running does nothing.
    pub fn start_monitoring(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            RuntimeError::Configuration(format!("Monitoring requires a tokio runtime: {}", e))
        })?;

        let (shutdown, mut stop) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let metrics = shared.record_sample();
                        debug!(
                            cpu = metrics.cpu_percent,
                            memory = metrics.memory_bytes,
                            active = metrics.active_tasks,
                            "Performance sample"
                        );
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *running = Some(MonitorLoop { shutdown, handle });
        info!(interval = ?self.interval, "Performance monitoring started");
        Ok(())
    }

    /// Signal the sampling loop to stop and wait for it to exit
    pub async fn stop_monitoring(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(MonitorLoop { shutdown, handle }) = running else {
            return Ok(());
        };

        // The loop also exits when the sender is gone, so a send error is harmless
        let _ = shutdown.send(true);
        handle.await?;
        info!("Performance monitoring stopped");
        Ok(())
    }

    /// Begin tracking a unit of work
    ///
    /// The returned guard must be finished with [`TaskGuard::complete`] or
    /// [`TaskGuard::fail`]; dropping it unfinished records a failure.
    pub fn start_task(&self, name: impl Into<String>) -> TaskGuard<'_> {
        let metrics = TaskMetrics::started(name.into());
        let task_id = metrics.task_id;

        let mut state = self.shared.state.lock();
        state.active.insert(
            task_id,
            TaskRecord {
                metrics,
                started: Instant::now(),
            },
        );
        state.peak_active = state.peak_active.max(state.active.len());

        TaskGuard {
            monitor: self,
            task_id,
            finished: false,
        }
    }

    /// Track `future` as one task, passing its result through unchanged
    pub async fn track<F, T, E>(&self, name: impl Into<String>, future: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let task = self.start_task(name);
        let result = future.await;
        match &result {
            Ok(_) => task.complete(),
            Err(error) => task.fail(error.to_string()),
        }
        result
    }

    fn finish_task(&self, task_id: Uuid, error: Option<String>) {
        let mut state = self.shared.state.lock();
        let Some(TaskRecord { mut metrics, started }) = state.active.remove(&task_id) else {
            return;
        };

        metrics.finish(started.elapsed(), error);
        if metrics.success {
            state.total_completed += 1;
        } else {
            state.total_failed += 1;
        }

        if state.completed.len() >= COMPLETED_TASK_CAPACITY {
            state.completed.pop_front();
        }
        state.completed.push_back(metrics);
    }

    /// Take a snapshot now and append it to the history
    pub fn sample_now(&self) -> PerformanceMetrics {
        self.shared.record_sample()
    }

    /// Recorded snapshots, oldest first
    pub fn history(&self) -> Vec<PerformanceMetrics> {
        self.shared.state.lock().history.iter().cloned().collect()
    }

    /// Finished tasks, oldest first
    pub fn completed_tasks(&self) -> Vec<TaskMetrics> {
        self.shared.state.lock().completed.iter().cloned().collect()
    }

    pub fn active_task_count(&self) -> usize {
        self.shared.state.lock().active.len()
    }

    /// Current values plus historical averages and peaks
    pub fn report(&self) -> PerformanceReport {
        let current = self.shared.snapshot();
        let state = self.shared.state.lock();
        let history: Vec<PerformanceMetrics> = state.history.iter().cloned().collect();

        PerformanceReport::build(
            current,
            &history,
            state.peak_active,
            self.shared.created.elapsed(),
        )
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            if running.shutdown.send(true).is_err() {
                running.handle.abort();
            }
        }
    }
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("interval", &self.interval)
            .field("history_size", &self.shared.history_size)
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

/// Scoped tracking of one task
#[must_use = "an unfinished TaskGuard records the task as failed when dropped"]
pub struct TaskGuard<'a> {
    monitor: &'a PerformanceMonitor,
    task_id: Uuid,
    finished: bool,
}

impl TaskGuard<'_> {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Mark the task successful
    pub fn complete(mut self) {
        self.finished = true;
        self.monitor.finish_task(self.task_id, None);
    }

    /// Mark the task failed with `error`
    pub fn fail(mut self, error: impl Into<String>) {
        self.finished = true;
        self.monitor.finish_task(self.task_id, Some(error.into()));
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let reason = if std::thread::panicking() {
                "panicked"
            } else {
                "cancelled"
            };
            warn!(task_id = %self.task_id, reason, "Task ended without completing");
            self.monitor.finish_task(self.task_id, Some(reason.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(Duration::from_millis(100), 5)
    }

    #[tokio::test]
    async fn test_track_success_and_failure() {
        let monitor = monitor();

        let ok: std::result::Result<u32, String> = monitor.track("ok", async { Ok(1) }).await;
        let err: std::result::Result<u32, String> =
            monitor.track("err", async { Err("bad gateway".to_string()) }).await;

        assert_eq!(ok, Ok(1));
        assert_eq!(err, Err("bad gateway".to_string()));

        let tasks = monitor.completed_tasks();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].success);
        assert_eq!(tasks[1].error.as_deref(), Some("bad gateway"));
        assert_eq!(monitor.active_task_count(), 0);
    }

    #[test]
    fn test_guard_dropped_unfinished_is_cancelled() {
        let monitor = monitor();
        {
            let _guard = monitor.start_task("abandoned");
            assert_eq!(monitor.active_task_count(), 1);
        }

        let tasks = monitor.completed_tasks();
        assert_eq!(tasks[0].error.as_deref(), Some("cancelled"));
        assert_eq!(monitor.report().total_failed, 1);
    }

    #[test]
    fn test_guard_dropped_during_panic() {
        let monitor = monitor();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = monitor.start_task("explodes");
            panic!("boom");
        }));

        assert!(result.is_err());
        assert_eq!(monitor.completed_tasks()[0].error.as_deref(), Some("panicked"));
    }

    #[test]
    fn test_peak_active_and_error_rate() {
        let monitor = monitor();
        let a = monitor.start_task("a");
        let b = monitor.start_task("b");
        let c = monitor.start_task("c");
        a.complete();
        b.complete();
        c.fail("timeout");

        let report = monitor.report();
        assert_eq!(report.peak_active_tasks, 3);
        assert_eq!(report.current.active_tasks, 0);
        assert!((report.current.error_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = monitor();
        for _ in 0..8 {
            monitor.sample_now();
        }
        assert_eq!(monitor.history().len(), 5);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let monitor = monitor();
        assert!(matches!(
            monitor.start_monitoring(),
            Err(RuntimeError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_loop_samples_until_stopped() {
        let monitor = PerformanceMonitor::new(Duration::from_millis(100), 50);
        monitor.start_monitoring().unwrap();
        monitor.start_monitoring().unwrap();
        assert!(monitor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(350)).await;
        monitor.stop_monitoring().await.unwrap();
        assert!(!monitor.is_monitoring());

        let samples = monitor.history().len();
        assert!(samples >= 3, "expected at least 3 samples, got {}", samples);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitor.history().len(), samples);
    }
}
