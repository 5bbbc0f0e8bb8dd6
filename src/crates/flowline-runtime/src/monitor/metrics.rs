//! Metric records produced by the performance monitor

use crate::logging::{format_bytes, format_duration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// One tracked unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub task_id: Uuid,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub success: bool,
    pub error: Option<String>,
}

impl TaskMetrics {
    pub(crate) fn started(name: String) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            name,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            success: false,
            error: None,
        }
    }

    pub(crate) fn finish(&mut self, duration: Duration, error: Option<String>) {
        self.end_time = Some(Utc::now());
        self.duration = Some(duration);
        self.success = error.is_none();
        self.error = error;
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Point-in-time snapshot of process and task metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub active_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Mean duration of recently finished tasks
    pub avg_latency: Duration,
    /// Finished tasks per second since the monitor was created
    pub throughput: f64,
    /// Failed share of all finished tasks
    pub error_rate: f64,
}

/// Current values plus historical averages and peaks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub current: PerformanceMetrics,
    pub avg_cpu_percent: f64,
    pub avg_memory_bytes: u64,
    pub peak_cpu_percent: f64,
    pub peak_memory_bytes: u64,
    pub peak_active_tasks: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub samples: usize,
    pub uptime: Duration,
}

impl PerformanceReport {
    pub(crate) fn build(
        current: PerformanceMetrics,
        history: &[PerformanceMetrics],
        peak_active_tasks: usize,
        uptime: Duration,
    ) -> Self {
        let samples: Vec<&PerformanceMetrics> = if history.is_empty() {
            vec![&current]
        } else {
            history.iter().chain(std::iter::once(&current)).collect()
        };
        let n = samples.len() as f64;

        let avg_cpu_percent = samples.iter().map(|m| m.cpu_percent).sum::<f64>() / n;
        let avg_memory_bytes =
            (samples.iter().map(|m| m.memory_bytes as f64).sum::<f64>() / n) as u64;
        let peak_cpu_percent = samples.iter().map(|m| m.cpu_percent).fold(0.0, f64::max);
        let peak_memory_bytes = samples.iter().map(|m| m.memory_bytes).max().unwrap_or(0);
        let peak_active_tasks = samples
            .iter()
            .map(|m| m.active_tasks)
            .max()
            .unwrap_or(0)
            .max(peak_active_tasks);

        Self {
            total_completed: current.completed_tasks,
            total_failed: current.failed_tasks,
            samples: history.len(),
            current,
            avg_cpu_percent,
            avg_memory_bytes,
            peak_cpu_percent,
            peak_memory_bytes,
            peak_active_tasks,
            uptime,
        }
    }
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Performance report (uptime {})", format_duration(self.uptime))?;
        writeln!(
            f,
            "  tasks: {} active, {} completed, {} failed (error rate {:.1}%)",
            self.current.active_tasks,
            self.total_completed,
            self.total_failed,
            self.current.error_rate * 100.0
        )?;
        writeln!(
            f,
            "  throughput: {:.2} tasks/s, avg latency {}",
            self.current.throughput,
            format_duration(self.current.avg_latency)
        )?;
        writeln!(
            f,
            "  cpu: {:.1}% now, {:.1}% avg, {:.1}% peak",
            self.current.cpu_percent, self.avg_cpu_percent, self.peak_cpu_percent
        )?;
        writeln!(
            f,
            "  memory: {} now, {} avg, {} peak",
            format_bytes(self.current.memory_bytes),
            format_bytes(self.avg_memory_bytes),
            format_bytes(self.peak_memory_bytes)
        )?;
        write!(
            f,
            "  peak active tasks: {} over {} samples",
            self.peak_active_tasks, self.samples
        )
    }
}
