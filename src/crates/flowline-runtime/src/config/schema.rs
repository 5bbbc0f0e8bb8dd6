//! Engine configuration schema

use super::builder::ConfigBuilder;
use super::env::{env_bool, env_key, env_parse};
use crate::load_balancer::BalancingStrategy;
use crate::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "FLOWLINE_";

/// Options recognized by the engine and its components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default per-chunk concurrency of the concurrency manager
    pub max_concurrent_calls: usize,

    /// Initial (or fixed, when not adaptive) chunk size
    pub batch_size: usize,

    /// Let the adaptive batch processor resize chunks
    pub adaptive_batch_size: bool,

    /// Lower bound for the adaptive chunk size
    pub min_batch_size: usize,

    /// Upper bound for the adaptive chunk size
    pub max_batch_size: usize,

    /// Run the performance monitor
    pub performance_monitoring: bool,

    /// Sampling interval of the monitor loop in milliseconds
    pub monitoring_interval_ms: u64,

    /// Number of snapshots the monitor keeps
    pub history_size: usize,

    /// Consecutive failures that open the circuit
    pub circuit_breaker_threshold: u32,

    /// Seconds an open circuit waits before admitting a probe
    pub recovery_timeout_secs: f64,

    /// Worker selection strategy of the load balancer
    pub balancing_strategy: BalancingStrategy,

    /// Size of the load balancer's worker pool
    pub max_workers: usize,

    /// Optional per-task deadline for load-balanced tasks
    pub task_timeout_secs: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 5,
            batch_size: 10,
            adaptive_batch_size: true,
            min_batch_size: 1,
            max_batch_size: 100,
            performance_monitoring: true,
            monitoring_interval_ms: 1000,
            history_size: 100,
            circuit_breaker_threshold: 5,
            recovery_timeout_secs: 60.0,
            balancing_strategy: BalancingStrategy::LeastLoaded,
            max_workers: 4,
            task_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default per-chunk concurrency
    pub fn with_max_concurrent_calls(mut self, n: usize) -> Self {
        self.max_concurrent_calls = n;
        self
    }

    /// Set the initial chunk size
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Enable or disable adaptive chunk sizing
    pub fn with_adaptive_batch_size(mut self, enabled: bool) -> Self {
        self.adaptive_batch_size = enabled;
        self
    }

    /// Set the adaptive chunk size bounds
    pub fn with_batch_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_batch_size = min;
        self.max_batch_size = max;
        self
    }

    /// Enable or disable the performance monitor
    pub fn with_performance_monitoring(mut self, enabled: bool) -> Self {
        self.performance_monitoring = enabled;
        self
    }

    /// Set the breaker's failure threshold
    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    /// Set the breaker's recovery timeout
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Set the load balancing strategy
    pub fn with_balancing_strategy(mut self, strategy: BalancingStrategy) -> Self {
        self.balancing_strategy = strategy;
        self
    }

    /// Set the worker pool size
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    /// Set the per-task deadline for load-balanced tasks
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// Recovery timeout as a [`Duration`]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs.max(0.0))
    }

    /// Monitor sampling interval as a [`Duration`]
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    /// Per-task deadline as a [`Duration`]
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

fn require_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(RuntimeError::Configuration(format!(
            "{} must be greater than zero",
            name
        )));
    }
    Ok(())
}

impl ConfigBuilder for EngineConfig {
    fn validate(&self) -> Result<()> {
        require_positive("max_concurrent_calls", self.max_concurrent_calls)?;
        require_positive("batch_size", self.batch_size)?;
        require_positive("min_batch_size", self.min_batch_size)?;
        require_positive("max_workers", self.max_workers)?;
        require_positive("history_size", self.history_size)?;

        if self.min_batch_size > self.max_batch_size {
            return Err(RuntimeError::Configuration(format!(
                "min_batch_size ({}) exceeds max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(RuntimeError::Configuration(
                "circuit_breaker_threshold must be greater than zero".to_string(),
            ));
        }
        if !(self.recovery_timeout_secs > 0.0) {
            return Err(RuntimeError::Configuration(
                "recovery_timeout_secs must be positive".to_string(),
            ));
        }
        if self.monitoring_interval_ms == 0 {
            return Err(RuntimeError::Configuration(
                "monitoring_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self, prefix: &str) -> Result<()> {
        let key = |field: &str| env_key(prefix, field);

        if let Some(v) = env_parse(&key("max_concurrent_calls"))? {
            self.max_concurrent_calls = v;
        }
        if let Some(v) = env_parse(&key("batch_size"))? {
            self.batch_size = v;
        }
        if let Some(v) = env_bool(&key("adaptive_batch_size"))? {
            self.adaptive_batch_size = v;
        }
        if let Some(v) = env_parse(&key("min_batch_size"))? {
            self.min_batch_size = v;
        }
        if let Some(v) = env_parse(&key("max_batch_size"))? {
            self.max_batch_size = v;
        }
        if let Some(v) = env_bool(&key("performance_monitoring"))? {
            self.performance_monitoring = v;
        }
        if let Some(v) = env_parse(&key("monitoring_interval_ms"))? {
            self.monitoring_interval_ms = v;
        }
        if let Some(v) = env_parse(&key("history_size"))? {
            self.history_size = v;
        }
        if let Some(v) = env_parse(&key("circuit_breaker_threshold"))? {
            self.circuit_breaker_threshold = v;
        }
        if let Some(v) = env_parse(&key("recovery_timeout_secs"))? {
            self.recovery_timeout_secs = v;
        }
        if let Some(v) = env_parse(&key("balancing_strategy"))? {
            self.balancing_strategy = v;
        }
        if let Some(v) = env_parse(&key("max_workers"))? {
            self.max_workers = v;
        }
        if let Some(v) = env_parse(&key("task_timeout_secs"))? {
            self.task_timeout_secs = Some(v);
        }
        Ok(())
    }

    fn merge(&mut self, other: Self) -> &mut Self {
        let defaults = Self::default();

        if other.max_concurrent_calls != defaults.max_concurrent_calls {
            self.max_concurrent_calls = other.max_concurrent_calls;
        }
        if other.batch_size != defaults.batch_size {
            self.batch_size = other.batch_size;
        }
        if other.adaptive_batch_size != defaults.adaptive_batch_size {
            self.adaptive_batch_size = other.adaptive_batch_size;
        }
        if other.min_batch_size != defaults.min_batch_size {
            self.min_batch_size = other.min_batch_size;
        }
        if other.max_batch_size != defaults.max_batch_size {
            self.max_batch_size = other.max_batch_size;
        }
        if other.performance_monitoring != defaults.performance_monitoring {
            self.performance_monitoring = other.performance_monitoring;
        }
        if other.monitoring_interval_ms != defaults.monitoring_interval_ms {
            self.monitoring_interval_ms = other.monitoring_interval_ms;
        }
        if other.history_size != defaults.history_size {
            self.history_size = other.history_size;
        }
        if other.circuit_breaker_threshold != defaults.circuit_breaker_threshold {
            self.circuit_breaker_threshold = other.circuit_breaker_threshold;
        }
        if other.recovery_timeout_secs != defaults.recovery_timeout_secs {
            self.recovery_timeout_secs = other.recovery_timeout_secs;
        }
        if other.balancing_strategy != defaults.balancing_strategy {
            self.balancing_strategy = other.balancing_strategy;
        }
        if other.max_workers != defaults.max_workers {
            self.max_workers = other.max_workers;
        }
        if other.task_timeout_secs.is_some() {
            self.task_timeout_secs = other.task_timeout_secs;
        }
        self
    }
}
