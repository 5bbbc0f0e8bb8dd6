//! Off-loading blocking work from the scheduler
//!
//! Blocking closures run on tokio's bounded blocking pool so that they never
//! occupy a thread driving async tasks.

use crate::{Result, RuntimeError};

/// Run a blocking closure on the blocking pool and await its result
///
/// A panic inside the closure is reported as [`RuntimeError::Join`].
pub async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(RuntimeError::from)
}

/// Run a fallible blocking closure, flattening its error into [`RuntimeError`]
pub async fn run_blocking_fallible<F, T, E>(f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    run_blocking(f).await?.map_err(RuntimeError::task_failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let value = run_blocking(|| {
            std::thread::sleep(Duration::from_millis(5));
            21 * 2
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_blocking_panic_is_join_error() {
        let result: Result<()> = run_blocking(|| panic!("worker exploded")).await;
        assert!(matches!(result, Err(RuntimeError::Join(_))));
    }

    #[tokio::test]
    async fn test_run_blocking_fallible_maps_error() {
        let result: Result<u8> = run_blocking_fallible(|| Err::<u8, _>("disk unavailable")).await;
        match result {
            Err(RuntimeError::TaskFailed(msg)) => assert_eq!(msg, "disk unavailable"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_work_does_not_starve_scheduler() {
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            "ticked"
        });

        let blocking = run_blocking(|| std::thread::sleep(Duration::from_millis(100)));
        let (tick, _) = tokio::join!(ticker, blocking);

        assert_eq!(tick.unwrap(), "ticked");
    }
}
