//! Feedback-controlled batch sizing
//!
//! Keeps the last few batch records and nudges the batch size up when recent
//! batches were nearly all successful, down when too many items failed.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Number of records kept
pub const HISTORY_CAPACITY: usize = 10;

/// Number of most recent records the controller averages over
pub const ADJUSTMENT_WINDOW: usize = 3;

/// Proportional step used for both growing and shrinking
pub const ADJUSTMENT_FACTOR: f64 = 0.2;

const SHRINK_BELOW: f64 = 0.8;
const GROW_ABOVE: f64 = 0.95;

/// Outcome of one completed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPerformanceRecord {
    pub batch_size: usize,
    pub execution_time: Duration,
    pub success_rate: f64,
    /// Items per second
    pub throughput: f64,
}

/// Tunes the batch size from recent success rate and throughput
#[derive(Debug, Clone)]
pub struct AdaptiveBatchProcessor {
    current: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    history: VecDeque<BatchPerformanceRecord>,
}

impl AdaptiveBatchProcessor {
    /// Create a controller starting at `initial`, clamped into `[min, max]`
    ///
    /// A zero minimum is raised to one and a maximum below the minimum is
    /// raised to the minimum.
    pub fn new(initial: usize, min_batch_size: usize, max_batch_size: usize) -> Self {
        let min_batch_size = min_batch_size.max(1);
        let max_batch_size = max_batch_size.max(min_batch_size);

        Self {
            current: initial.clamp(min_batch_size, max_batch_size),
            min_batch_size,
            max_batch_size,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn current_batch_size(&self) -> usize {
        self.current
    }

    pub fn min_batch_size(&self) -> usize {
        self.min_batch_size
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Recorded batches, oldest first
    pub fn history(&self) -> Vec<BatchPerformanceRecord> {
        self.history.iter().cloned().collect()
    }

    /// Record a finished batch and return the size for the next one
    pub fn record_batch(
        &mut self,
        batch_size: usize,
        execution_time: Duration,
        success_rate: f64,
    ) -> usize {
        let secs = execution_time.as_secs_f64();
        let throughput = if secs > 0.0 {
            batch_size as f64 / secs
        } else {
            0.0
        };

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(BatchPerformanceRecord {
            batch_size,
            execution_time,
            success_rate: success_rate.clamp(0.0, 1.0),
            throughput,
        });

        self.adjust();
        self.current
    }

    fn adjust(&mut self) {
        if self.history.len() < ADJUSTMENT_WINDOW {
            return;
        }

        let recent = self.history.iter().rev().take(ADJUSTMENT_WINDOW);
        let (rate_sum, throughput_sum) =
            recent.fold((0.0, 0.0), |(r, t), rec| (r + rec.success_rate, t + rec.throughput));
        let avg_success = rate_sum / ADJUSTMENT_WINDOW as f64;
        let avg_throughput = throughput_sum / ADJUSTMENT_WINDOW as f64;

        let previous = self.current;
        let proposed = if avg_success < SHRINK_BELOW {
            let scaled = (previous as f64 * (1.0 - ADJUSTMENT_FACTOR)).round() as usize;
            scaled.min(previous.saturating_sub(1))
        } else if avg_success > GROW_ABOVE && avg_throughput > 0.0 {
            let scaled = (previous as f64 * (1.0 + ADJUSTMENT_FACTOR)).round() as usize;
            scaled.max(previous.saturating_add(1))
        } else {
            previous
        };

        self.current = proposed.clamp(self.min_batch_size, self.max_batch_size);

        if self.current != previous {
            debug!(
                from = previous,
                to = self.current,
                avg_success,
                avg_throughput,
                "Adjusted batch size"
            );
        }
    }
}
