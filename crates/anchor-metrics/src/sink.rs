//! The metrics sink port.

use std::sync::Arc;
use std::time::Duration;

/// Destination for runtime metrics. Names are dot-separated
/// (`rpc.orders.place.not_active_retry`).
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, by: u64);
    fn set_gauge(&self, name: &str, value: f64);
    fn record_duration(&self, name: &str, duration: Duration);
}

pub type SharedSink = Arc<dyn MetricsSink>;

/// Sink that drops every measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NoopSink {
    pub fn shared() -> SharedSink {
        Arc::new(NoopSink)
    }
}

impl MetricsSink for NoopSink {
    fn incr_counter(&self, _name: &str, _by: u64) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
    fn record_duration(&self, _name: &str, _duration: Duration) {}
}
