//! Runtime primitives for flowline pipelines
//!
//! This crate provides the pieces that protect and schedule calls to slow,
//! failure-prone downstream services. It has no notion of nodes or flows;
//! `flowline-core` builds the graph layer on top of it.
//!
//! # Modules
//!
//! - `circuit_breaker` - CLOSED/OPEN/HALF_OPEN guard with a single half-open probe
//! - `adaptive_batch` - batch sizing driven by recent success rate and throughput
//! - `concurrency` - chunked, semaphore-bounded batch execution behind a breaker
//! - `load_balancer` - fixed worker pool with least-loaded, round-robin or weighted assignment
//! - `monitor` - task tracking and periodic process sampling
//! - `engine` - explicit owner of one instance of each component
//! - `config` - `EngineConfig` with file and environment loading
//! - `async_utils` - retry policies, timeouts and blocking off-load
//! - `logging` - subscriber setup and formatting helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use flowline_runtime::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default().with_max_workers(3))?;
//! engine.start()?;
//!
//! let summaries = engine
//!     .concurrency_manager()
//!     .process_batch(chunks, |chunk| summarize(chunk), None)
//!     .await;
//!
//! engine.shutdown().await?;
//! ```

pub mod adaptive_batch;
pub mod async_utils;
pub mod circuit_breaker;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod load_balancer;
pub mod logging;
pub mod monitor;

pub use adaptive_batch::{AdaptiveBatchProcessor, BatchPerformanceRecord};
pub use circuit_breaker::{CallOutcome, CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use concurrency::{ConcurrencyManager, ConcurrencyStats};
pub use config::{ConfigBuilder, EngineConfig};
pub use engine::Engine;
pub use error::{format_error_chain, Result, RuntimeError};
pub use load_balancer::{BalancerReport, BalancingStrategy, LoadBalancer, WorkerStats};
pub use monitor::{PerformanceMetrics, PerformanceMonitor, PerformanceReport, TaskGuard, TaskMetrics};

/// Get version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
