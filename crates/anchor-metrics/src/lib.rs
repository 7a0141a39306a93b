//! anchor-metrics — observability for the coordination runtime.
//!
//! Components report through the [`MetricsSink`] port: counters for retry
//! and cache events, gauges for registry sizes, durations for failover
//! latency. [`MetricsCollector`] keeps them in memory and the daemon renders
//! them with [`render_prometheus`].
//!
//! # Architecture
//!
//! ```text
//! Arc<dyn MetricsSink>
//!   ├── MetricsCollector   in-memory counters, gauges, duration samples
//!   └── NoopSink           discards everything
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;
pub mod sink;

pub use collector::{DurationSummary, MetricsCollector, MetricsSnapshot};
pub use prometheus::render_prometheus;
pub use sink::{MetricsSink, NoopSink, SharedSink};
