//! Process resource sampling
//!
//! Reads `/proc/self/stat` and `/proc/self/status` on Linux. Other platforms
//! report zeros. CPU percentage assumes 100 clock ticks per second and is
//! approximate on kernels configured otherwise.

use std::time::Instant;

/// Kernel clock ticks per second used by `/proc/self/stat` on common Linux
/// configurations
///
/// `USER_HZ` is not queried, so on a kernel built with a different value the
/// reported CPU percentage is scaled wrongly and only approximate.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Resource usage at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Computes CPU usage as the delta since the previous sample
#[derive(Debug, Default)]
pub struct ProcessSampler {
    previous: Option<(u64, Instant)>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self) -> ProcessSample {
        let now = Instant::now();
        let memory_bytes = read_rss_bytes().unwrap_or(0);

        let cpu_percent = match read_cpu_ticks() {
            Some(ticks) => {
                let percent = match self.previous {
                    Some((prev_ticks, prev_at)) => {
                        let wall = now.duration_since(prev_at).as_secs_f64();
                        if wall > 0.0 {
                            let busy = ticks.saturating_sub(prev_ticks) as f64 / CLOCK_TICKS_PER_SEC;
                            busy / wall * 100.0
                        } else {
                            0.0
                        }
                    }
                    None => 0.0,
                };
                self.previous = Some((ticks, now));
                percent
            }
            None => 0.0,
        };

        ProcessSample {
            cpu_percent,
            memory_bytes,
        }
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_cpu_ticks(&stat)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn read_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_rss_bytes(&status)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes() -> Option<u64> {
    None
}

/// utime + stime from a `/proc/<pid>/stat` line
///
/// The command name may contain spaces, so fields are counted from the last
/// closing parenthesis.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn parse_rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_ticks() {
        let stat = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 75 0 0 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat), Some(325));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[test]
    fn test_parse_rss_bytes() {
        let status = "Name:\tflowline\nVmPeak:\t  9000 kB\nVmRSS:\t  4096 kB\nThreads:\t4\n";
        assert_eq!(parse_rss_bytes(status), Some(4096 * 1024));
        assert_eq!(parse_rss_bytes("Name:\tx\n"), None);
    }

    #[test]
    fn test_first_sample_has_no_cpu_delta() {
        let mut sampler = ProcessSampler::new();
        let first = sampler.sample();
        assert_eq!(first.cpu_percent, 0.0);
        assert!(sampler.sample().cpu_percent >= 0.0);
    }
}
