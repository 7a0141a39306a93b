//! Prometheus text exposition format.
//!
//! Metric names are dot-separated internally; exposition replaces every
//! character outside `[a-zA-Z0-9_]` with `_` and prefixes `anchor_`.

use crate::collector::MetricsSnapshot;

fn metric_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("anchor_{sanitized}")
}

/// Render a snapshot into Prometheus text format.
///
/// Counters get a `_total` suffix; durations are exposed as summaries in
/// milliseconds.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    for (name, value) in &snapshot.counters {
        let name = metric_name(name);
        out.push_str(&format!("# TYPE {name}_total counter\n"));
        out.push_str(&format!("{name}_total {value}\n"));
    }

    for (name, value) in &snapshot.gauges {
        let name = metric_name(name);
        out.push_str(&format!("# TYPE {name} gauge\n"));
        out.push_str(&format!("{name} {value}\n"));
    }

    for (name, summary) in &snapshot.durations {
        let name = format!("{}_ms", metric_name(name));
        out.push_str(&format!("# TYPE {name} summary\n"));
        out.push_str(&format!("{name}{{quantile=\"0.5\"}} {:.3}\n", summary.p50_ms));
        out.push_str(&format!("{name}{{quantile=\"0.99\"}} {:.3}\n", summary.p99_ms));
        out.push_str(&format!("{name}_sum {:.3}\n", summary.sum_ms));
        out.push_str(&format!("{name}_count {}\n", summary.count));
    }

    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{MetricsCollector, MetricsSink};

    #[test]
    fn render_empty() {
        assert_eq!(render_prometheus(&MetricsSnapshot::default()), "");
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(
            metric_name("rpc.order-service.place.not_active_retry"),
            "anchor_rpc_order_service_place_not_active_retry"
        );
    }

    #[test]
    fn renders_all_kinds() {
        let m = MetricsCollector::new();
        m.incr_counter("discovery.cache.hit", 7);
        m.set_gauge("registry.orders.instances", 3.0);
        m.record_duration("rpc.orders.place.failover_latency", Duration::from_millis(12));

        let output = render_prometheus(&m.snapshot());
        assert!(output.contains("# TYPE anchor_discovery_cache_hit_total counter"));
        assert!(output.contains("anchor_discovery_cache_hit_total 7\n"));
        assert!(output.contains("anchor_registry_orders_instances 3\n"));
        assert!(output.contains("anchor_rpc_orders_place_failover_latency_ms{quantile=\"0.5\"} 12.000"));
        assert!(output.contains("anchor_rpc_orders_place_failover_latency_ms_count 1"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let m = MetricsCollector::new();
        m.incr_counter("a.b", 1);
        m.set_gauge("c", 0.5);
        let output = render_prometheus(&m.snapshot());

        for line in output.lines() {
            if line.starts_with('#') {
                continue;
            }
            let mut parts = line.split(' ');
            let name = parts.next().unwrap();
            let value = parts.next().unwrap();
            assert!(name.starts_with("anchor_"), "bad name: {line}");
            assert!(value.parse::<f64>().is_ok(), "bad value: {line}");
        }
    }
}
