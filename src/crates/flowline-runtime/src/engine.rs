//! Engine lifecycle
//!
//! [`Engine`] owns one instance of each runtime component, built from a single
//! [`EngineConfig`]. Callers hold the engine (or the `Arc`s it hands out)
//! explicitly; there is no process-wide state.

use crate::concurrency::ConcurrencyManager;
use crate::config::{ConfigBuilder, EngineConfig};
use crate::load_balancer::LoadBalancer;
use crate::monitor::{PerformanceMonitor, PerformanceReport};
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Owner of the concurrency manager, load balancer and performance monitor
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    monitor: Option<Arc<PerformanceMonitor>>,
    concurrency: Arc<ConcurrencyManager>,
    balancer: Arc<LoadBalancer>,
}

impl Engine {
    /// Validate `config` and build the components
    ///
    /// The monitor is only created when `performance_monitoring` is enabled;
    /// when it is, the manager and the balancer both report to it.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let monitor = config
            .performance_monitoring
            .then(|| Arc::new(PerformanceMonitor::from_config(&config)));

        let mut concurrency = ConcurrencyManager::from_config(&config);
        let mut balancer = LoadBalancer::from_config(&config);
        if let Some(monitor) = &monitor {
            concurrency = concurrency.with_monitor(Arc::clone(monitor));
            balancer = balancer.with_monitor(Arc::clone(monitor));
        }

        info!(
            max_concurrent_calls = config.max_concurrent_calls,
            max_workers = config.max_workers,
            strategy = %config.balancing_strategy,
            monitoring = config.performance_monitoring,
            "Engine initialized"
        );

        Ok(Self {
            config,
            monitor,
            concurrency: Arc::new(concurrency),
            balancer: Arc::new(balancer),
        })
    }

    /// Build from defaults and `FLOWLINE_*` environment overrides
    pub fn from_env() -> Result<Self> {
        Self::new(EngineConfig::from_env(crate::config::ENV_PREFIX)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start background monitoring, if enabled
    pub fn start(&self) -> Result<()> {
        if let Some(monitor) = &self.monitor {
            monitor.start_monitoring()?;
        }
        Ok(())
    }

    /// Stop background monitoring and log a final report
    ///
    /// Returns the report when monitoring is enabled.
    pub async fn shutdown(&self) -> Result<Option<PerformanceReport>> {
        let Some(monitor) = &self.monitor else {
            info!("Engine shut down");
            return Ok(None);
        };

        monitor.stop_monitoring().await?;
        let report = monitor.report();
        info!(
            completed = report.total_completed,
            failed = report.total_failed,
            peak_active = report.peak_active_tasks,
            "Engine shut down\n{}",
            report
        );
        Ok(Some(report))
    }

    pub fn concurrency_manager(&self) -> Arc<ConcurrencyManager> {
        Arc::clone(&self.concurrency)
    }

    pub fn load_balancer(&self) -> Arc<LoadBalancer> {
        Arc::clone(&self.balancer)
    }

    pub fn performance_monitor(&self) -> Option<Arc<PerformanceMonitor>> {
        self.monitor.clone()
    }
}
