//! Per-interface byte counters from /proc/net/dev with derived rates.

use super::{InterfaceTraffic, TrafficStats};
use chrono::Utc;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
struct RawCounters {
    rx_bytes: u64,
    tx_bytes: u64,
    rx_errs: u64,
    tx_errs: u64,
    rx_drop: u64,
    tx_drop: u64,
    collisions: u64,
}

#[derive(Default)]
struct TrafficState {
    last_time: Option<Instant>,
    last: HashMap<String, RawCounters>,
}

/// Samples /proc/net/dev and turns counter deltas into byte rates. The
/// scheduler never overlaps invocations; the mutex protects the last-sample
/// table anyway.
pub struct TrafficProbe {
    state: Mutex<TrafficState>,
}

impl TrafficProbe {
    pub fn new() -> Self {
        TrafficProbe {
            state: Mutex::new(TrafficState::default()),
        }
    }

    pub fn collect(&self) -> TrafficStats {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.collect_inner())) {
            Ok(stats) => stats,
            Err(_) => TrafficStats {
                error: Some("panic in traffic probe".to_string()),
                ..Default::default()
            },
        }
    }

    fn collect_inner(&self) -> TrafficStats {
        let content = match std::fs::read_to_string("/proc/net/dev") {
            Ok(c) => c,
            Err(e) => {
                return TrafficStats {
                    error: Some(format!("reading /proc/net/dev: {}", e)),
                    ..Default::default()
                };
            }
        };
        self.sample(&content, Instant::now())
    }

    /// Rate computation against the stored previous sample. Split out from
    /// collect so counter sources and timestamps can be injected.
    fn sample(&self, content: &str, now: Instant) -> TrafficStats {
        let counters = parse_proc_net_dev(content);

        let mut state = self.state.lock().unwrap();
        let elapsed = state
            .last_time
            .map(|t| now.saturating_duration_since(t).as_secs_f64());

        let mut stats = TrafficStats {
            timestamp: Utc::now(),
            interfaces: HashMap::new(),
            error: None,
        };

        for (name, cur) in &counters {
            let mut t = InterfaceTraffic {
                rx_bytes: cur.rx_bytes,
                tx_bytes: cur.tx_bytes,
                rx_rate: 0.0,
                tx_rate: 0.0,
                drops: cur.rx_drop + cur.tx_drop,
                errors: cur.rx_errs + cur.tx_errs,
                collisions: cur.collisions,
            };

            // Rates need a prior sample and monotonic counters; a counter
            // that went backwards (reset or device re-creation) yields a
            // zero rate while the absolute values still propagate.
            if let Some(elapsed) = elapsed {
                if elapsed > 0.0 {
                    if let Some(last) = state.last.get(name) {
                        if cur.rx_bytes >= last.rx_bytes {
                            t.rx_rate = (cur.rx_bytes - last.rx_bytes) as f64 / elapsed;
                        }
                        if cur.tx_bytes >= last.tx_bytes {
                            t.tx_rate = (cur.tx_bytes - last.tx_bytes) as f64 / elapsed;
                        }
                    }
                }
            }

            stats.interfaces.insert(name.clone(), t);
        }

        state.last = counters.into_iter().collect();
        state.last_time = Some(now);
        stats
    }
}

/// Parse the two-header /proc/net/dev table. Lines that do not look like
/// an interface row are skipped.
fn parse_proc_net_dev(content: &str) -> Vec<(String, RawCounters)> {
    let mut out = Vec::new();
    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|f| f.parse().unwrap_or(0))
            .collect();
        if fields.len() < 16 {
            continue;
        }
        out.push((
            name.trim().to_string(),
            RawCounters {
                rx_bytes: fields[0],
                rx_errs: fields[2],
                rx_drop: fields[3],
                tx_bytes: fields[8],
                tx_errs: fields[10],
                tx_drop: fields[11],
                collisions: fields[13],
            },
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HEADER: &str = "Inter-|   Receive                                                |  Transmit\n face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n";

    fn dev_line(name: &str, rx_bytes: u64, tx_bytes: u64) -> String {
        format!(
            "{}{}: {} 10 1 2 0 0 0 0 {} 8 3 4 0 5 0 0\n",
            HEADER, name, rx_bytes, tx_bytes
        )
    }

    #[test]
    fn test_parse_proc_net_dev() {
        let parsed = parse_proc_net_dev(&dev_line("eth0", 1000, 2000));
        assert_eq!(parsed.len(), 1);
        let (name, c) = &parsed[0];
        assert_eq!(name, "eth0");
        assert_eq!(c.rx_bytes, 1000);
        assert_eq!(c.tx_bytes, 2000);
        assert_eq!(c.rx_errs, 1);
        assert_eq!(c.rx_drop, 2);
        assert_eq!(c.tx_errs, 3);
        assert_eq!(c.tx_drop, 4);
        assert_eq!(c.collisions, 5);
    }

    #[test]
    fn test_first_sample_has_zero_rates() {
        let probe = TrafficProbe::new();
        let stats = probe.sample(&dev_line("eth0", 1000, 500), Instant::now());
        let t = &stats.interfaces["eth0"];
        assert_eq!(t.rx_bytes, 1000);
        assert_eq!(t.rx_rate, 0.0);
        assert_eq!(t.tx_rate, 0.0);
        assert_eq!(t.drops, 6);
        assert_eq!(t.errors, 4);
    }

    #[test]
    fn test_rate_from_delta() {
        let probe = TrafficProbe::new();
        let t0 = Instant::now();
        probe.sample(&dev_line("eth0", 1000, 0), t0);
        let stats = probe.sample(&dev_line("eth0", 3048, 1024), t0 + Duration::from_secs(1));
        let t = &stats.interfaces["eth0"];
        assert_eq!(t.rx_bytes, 3048);
        assert!((t.rx_rate - 2048.0).abs() < 1e-6);
        assert!((t.tx_rate - 1024.0).abs() < 1e-6);
    }

    #[test]
    fn test_counter_reset_yields_zero_rate() {
        let probe = TrafficProbe::new();
        let t0 = Instant::now();
        probe.sample(&dev_line("eth0", 5000, 5000), t0);
        let stats = probe.sample(&dev_line("eth0", 100, 100), t0 + Duration::from_secs(1));
        let t = &stats.interfaces["eth0"];
        assert_eq!(t.rx_rate, 0.0);
        assert_eq!(t.tx_rate, 0.0);
        // Absolute counters still propagate.
        assert_eq!(t.rx_bytes, 100);
    }

    #[test]
    fn test_idle_converges_to_zero_rate() {
        let probe = TrafficProbe::new();
        let t0 = Instant::now();
        probe.sample(&dev_line("eth0", 7777, 8888), t0);
        let stats = probe.sample(&dev_line("eth0", 7777, 8888), t0 + Duration::from_secs(1));
        let t = &stats.interfaces["eth0"];
        assert_eq!(t.rx_rate, 0.0);
        assert_eq!(t.tx_rate, 0.0);
    }

    #[test]
    fn test_collect_against_live_proc() {
        if !std::path::Path::new("/proc/net/dev").exists() {
            return;
        }
        let probe = TrafficProbe::new();
        let stats = probe.collect();
        assert!(stats.error.is_none());
        assert!(!stats.interfaces.is_empty());
    }
}
