//! Logging helpers
//!
//! The runtime only emits `tracing` events; installing a subscriber is left to
//! the binary or test that hosts it. [`init_tracing`] is a convenience for
//! the common case.

use std::time::{Duration, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `RUST_LOG`
///
/// Falls back to `default_filter` (e.g. `"info"` or
/// `"flowline_core=debug,flowline_runtime=info"`) when `RUST_LOG` is unset.
/// Calling it again after a subscriber is installed is a no-op.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Await `future`, logging how long it took
///
/// ```rust,ignore
/// let report = timed("summarize_batch", manager.process_batch(items, call, None)).await;
/// ```
pub async fn timed<F, T>(name: &str, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    debug!(operation = name, "Started");
    let output = future.await;
    debug!(operation = name, elapsed = %format_duration(start.elapsed()), "Finished");
    output
}

/// Render a duration with the coarsest unit that keeps it readable
///
/// ```rust
/// use flowline_runtime::logging::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_millis(2500)), "2.50s");
/// assert_eq!(format_duration(Duration::from_secs(180)), "3m0s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    match duration.as_micros() {
        us if us < 1_000 => format!("{}μs", us),
        us if us < 1_000_000 => format!("{}ms", duration.as_millis()),
        us if us < 60_000_000 => format!("{:.2}s", duration.as_secs_f64()),
        _ => {
            let secs = duration.as_secs();
            format!("{}m{}s", secs / 60, secs % 60)
        }
    }
}

/// Render a byte count in binary units, as used for resident memory
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_units() {
        let cases = [
            (Duration::from_micros(250), "250μs"),
            (Duration::from_millis(42), "42ms"),
            (Duration::from_millis(999), "999ms"),
            (Duration::from_secs(1), "1.00s"),
            (Duration::from_secs(61), "1m1s"),
        ];
        for (duration, expected) in cases {
            assert_eq!(format_duration(duration), expected);
        }
    }

    #[test]
    fn test_byte_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(300 * 1024 * 1024), "300.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing("flowline_runtime=debug");
        init_tracing("warn");
    }

    #[tokio::test]
    async fn test_timed_returns_output() {
        let items = timed("collect", async { vec![1, 2, 3] }).await;
        assert_eq!(items.len(), 3);
    }
}
