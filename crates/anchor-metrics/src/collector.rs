//! In-memory implementation of the sink port.
//!
//! Counters are atomics behind a read-mostly map; gauges and duration
//! samples sit behind short-lived mutexes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::trace;

use crate::sink::MetricsSink;

/// Samples kept per duration metric; older samples are dropped first.
const MAX_DURATION_SAMPLES: usize = 1024;

#[derive(Default)]
struct DurationStats {
    count: u64,
    sum_us: u64,
    /// Recent samples (microseconds) for percentile computation.
    samples: VecDeque<u64>,
}

/// Aggregated view of one duration metric.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationSummary {
    pub count: u64,
    pub sum_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
}

/// Point-in-time copy of every metric, sorted by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub durations: BTreeMap<String, DurationSummary>,
}

#[derive(Default)]
pub struct MetricsCollector {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    gauges: Mutex<HashMap<String, f64>>,
    durations: Mutex<HashMap<String, DurationStats>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        let counters = self.counters.read().unwrap();
        counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().unwrap().get(name).copied()
    }

    /// Recorded samples for a duration metric, oldest first.
    pub fn duration_samples(&self, name: &str) -> Vec<Duration> {
        let durations = self.durations.lock().unwrap();
        durations
            .get(name)
            .map(|d| d.samples.iter().map(|us| Duration::from_micros(*us)).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let durations = self
            .durations
            .lock()
            .unwrap()
            .iter()
            .map(|(k, stats)| {
                let (p50_ms, p99_ms) = compute_percentiles(&stats.samples);
                let summary = DurationSummary {
                    count: stats.count,
                    sum_ms: stats.sum_us as f64 / 1000.0,
                    p50_ms,
                    p99_ms,
                };
                (k.clone(), summary)
            })
            .collect();

        MetricsSnapshot {
            counters,
            gauges,
            durations,
        }
    }
}

impl MetricsSink for MetricsCollector {
    fn incr_counter(&self, name: &str, by: u64) {
        {
            let counters = self.counters.read().unwrap();
            if let Some(c) = counters.get(name) {
                c.fetch_add(by, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(by, Ordering::Relaxed);
        trace!(%name, "counter registered");
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.lock().unwrap().insert(name.to_string(), value);
    }

    fn record_duration(&self, name: &str, duration: Duration) {
        let us = duration.as_micros() as u64;
        let mut durations = self.durations.lock().unwrap();
        let stats = durations.entry(name.to_string()).or_default();
        stats.count += 1;
        stats.sum_us += us;
        if stats.samples.len() == MAX_DURATION_SAMPLES {
            stats.samples.pop_front();
        }
        stats.samples.push_back(us);
    }
}

/// Compute P50 and P99 from microsecond samples.
///
/// Returns (p50_ms, p99_ms). If empty, returns (0.0, 0.0).
fn compute_percentiles<'a>(samples: impl IntoIterator<Item = &'a u64>) -> (f64, f64) {
    let mut sorted: Vec<u64> = samples.into_iter().copied().collect();
    if sorted.is_empty() {
        return (0.0, 0.0);
    }
    sorted.sort_unstable();

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)] as f64 / 1000.0;
    let p99 = sorted[p99_idx.min(sorted.len() - 1)] as f64 / 1000.0;

    (p50, p99)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsCollector::new();
        assert_eq!(m.counter("rpc.orders.place.not_active_retry"), 0);
        m.incr_counter("rpc.orders.place.not_active_retry", 1);
        m.incr_counter("rpc.orders.place.not_active_retry", 2);
        assert_eq!(m.counter("rpc.orders.place.not_active_retry"), 3);
    }

    #[test]
    fn gauges_overwrite() {
        let m = MetricsCollector::new();
        assert_eq!(m.gauge("registry.orders.instances"), None);
        m.set_gauge("registry.orders.instances", 3.0);
        m.set_gauge("registry.orders.instances", 2.0);
        assert_eq!(m.gauge("registry.orders.instances"), Some(2.0));
    }

    #[test]
    fn durations_are_summarized() {
        let m = MetricsCollector::new();
        for ms in [10, 20, 30, 40] {
            m.record_duration("rpc.orders.place.failover_latency", Duration::from_millis(ms));
        }
        assert_eq!(m.duration_samples("rpc.orders.place.failover_latency").len(), 4);

        let snap = m.snapshot();
        let summary = &snap.durations["rpc.orders.place.failover_latency"];
        assert_eq!(summary.count, 4);
        assert_eq!(summary.sum_ms, 100.0);
        assert_eq!(summary.p50_ms, 30.0);
        assert_eq!(summary.p99_ms, 40.0);
    }

    #[test]
    fn duration_samples_are_bounded() {
        let m = MetricsCollector::new();
        for _ in 0..(MAX_DURATION_SAMPLES + 10) {
            m.record_duration("d", Duration::from_millis(1));
        }
        m.record_duration("d", Duration::from_millis(7));
        let samples = m.duration_samples("d");
        assert_eq!(samples.len(), MAX_DURATION_SAMPLES);
        assert_eq!(samples.last(), Some(&Duration::from_millis(7)));
        assert_eq!(m.snapshot().durations["d"].count, (MAX_DURATION_SAMPLES + 11) as u64);
    }

    #[test]
    fn percentiles_of_empty_are_zero() {
        assert_eq!(compute_percentiles(&[]), (0.0, 0.0));
        assert_eq!(compute_percentiles(&[5000]), (5.0, 5.0));
    }
}
