//! Batch processing, adaptive sizing and circuit breaking working together

use flowline_runtime::{
    CallOutcome, CircuitBreaker, CircuitState, ConcurrencyManager, EngineConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_half_failing_batches_never_grow() {
    let config = EngineConfig::default()
        .with_batch_size(20)
        .with_batch_bounds(4, 50)
        .with_circuit_breaker_threshold(1_000);
    let manager = ConcurrencyManager::from_config(&config);

    let mut sizes = vec![manager.current_batch_size()];
    for _ in 0..5 {
        let items: Vec<usize> = (0..manager.current_batch_size()).collect();
        let results = manager
            .process_batch(
                items,
                |i| async move {
                    if i % 2 == 0 {
                        Ok(i)
                    } else {
                        Err("induced failure")
                    }
                },
                None,
            )
            .await;
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), results.len().div_ceil(2));
        sizes.push(manager.current_batch_size());
    }

    assert!(sizes.windows(2).all(|w| w[1] <= w[0]), "sizes grew: {:?}", sizes);
    assert!(sizes.iter().all(|&s| s >= 4));
    assert!(sizes.last() < sizes.first());
}

#[tokio::test]
async fn test_healthy_batches_grow_to_ceiling() {
    let config = EngineConfig::default()
        .with_batch_size(5)
        .with_batch_bounds(1, 12);
    let manager = ConcurrencyManager::from_config(&config);

    for _ in 0..10 {
        manager
            .process_batch(
                vec![1u8; 5],
                |x| async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Ok::<_, String>(x)
                },
                None,
            )
            .await;
    }

    assert_eq!(manager.current_batch_size(), 12);
}

#[tokio::test]
async fn test_results_align_with_input() {
    let manager = ConcurrencyManager::from_config(&EngineConfig::default().with_batch_size(3));
    let items: Vec<String> = ["alpha", "", "gamma", "delta", "", "zeta", "eta"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let results = manager
        .process_batch(
            items,
            |s: String| async move {
                if s.is_empty() {
                    Err("empty input")
                } else {
                    Ok(s.len())
                }
            },
            Some(2),
        )
        .await;

    assert_eq!(
        results,
        vec![Some(5), None, Some(5), Some(5), None, Some(4), Some(3)]
    );
    let stats = manager.stats();
    assert_eq!(stats.total_processed, 7);
    assert_eq!(stats.total_failed, 2);
    assert_eq!(stats.total_rejected, 0);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_lifecycle() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
    let invoked = AtomicUsize::new(0);

    let failing = || async {
        invoked.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>("service unavailable")
    };

    for _ in 0..3 {
        assert!(matches!(breaker.call(failing).await, CallOutcome::Failed(_)));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // rejected without running while the recovery window is open
    for _ in 0..5 {
        assert!(breaker.call(failing).await.is_rejected());
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(matches!(breaker.call(failing).await, CallOutcome::Failed(_)));
    assert_eq!(invoked.load(Ordering::SeqCst), 4);
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(11)).await;
    let probe = breaker.call(|| async { Ok::<_, &str>("recovered") }).await;
    assert_eq!(probe.ok(), Some("recovered"));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}
