//! Deadlines for worker tasks
//!
//! The inner future is dropped when the deadline expires, which cancels it
//! and runs any drop guards it holds (worker slots, breaker probes).

use crate::RuntimeError;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Why a deadline-bounded task produced no value
#[derive(Debug)]
pub enum TimeoutError<E> {
    /// The task finished in time but returned an error
    Failed(E),
    /// The deadline expired first
    Elapsed(Duration),
}

impl<E> TimeoutError<E> {
    pub fn is_elapsed(&self) -> bool {
        matches!(self, TimeoutError::Elapsed(_))
    }
}

impl<E: fmt::Display> fmt::Display for TimeoutError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutError::Failed(error) => write!(f, "{}", error),
            TimeoutError::Elapsed(limit) => write!(f, "deadline of {:?} expired", limit),
        }
    }
}

impl<E: fmt::Display> From<TimeoutError<E>> for RuntimeError {
    fn from(err: TimeoutError<E>) -> Self {
        match err {
            TimeoutError::Failed(error) => RuntimeError::task_failed(error),
            TimeoutError::Elapsed(limit) => RuntimeError::Timeout(limit),
        }
    }
}

/// Await `task` for at most `limit`
pub async fn with_timeout<F, T, E>(limit: Duration, task: F) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::time::timeout(limit, task)
        .await
        .map_err(|_| TimeoutError::Elapsed(limit))?
        .map_err(TimeoutError::Failed)
}

/// [`with_timeout`] when a limit is given, a plain await otherwise
pub async fn with_optional_timeout<F, T, E>(limit: Option<Duration>, task: F) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match limit {
        Some(limit) => with_timeout(limit, task).await,
        None => task.await.map_err(TimeoutError::Failed),
    }
}
