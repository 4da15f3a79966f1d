use std::collections::HashMap;
use std::sync::Mutex;

/// Simple trait for metrics instrumentation
pub trait MetricsCollector: Send + Sync {
    fn inc_counter(&self, name: &str);
    fn observe_gauge(&self, name: &str, value: f64);
}

/// Discards everything. Default for nodes that don't care.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn inc_counter(&self, _name: &str) {}
    fn observe_gauge(&self, _name: &str, _value: f64) {}
}

/// Keeps counters and last-seen gauge values in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().ok().and_then(|g| g.get(name).copied())
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn inc_counter(&self, name: &str) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    fn observe_gauge(&self, name: &str, value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(name.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = InMemoryMetrics::new();
        metrics.inc_counter("elections_started");
        metrics.inc_counter("elections_started");

        assert_eq!(metrics.counter("elections_started"), 2);
        assert_eq!(metrics.counter("never_touched"), 0);
    }

    #[test]
    fn test_gauge_keeps_last_value() {
        let metrics = InMemoryMetrics::new();
        metrics.observe_gauge("commit_index", 3.0);
        metrics.observe_gauge("commit_index", 7.0);

        assert_eq!(metrics.gauge("commit_index"), Some(7.0));
        assert_eq!(metrics.gauge("term"), None);
    }
}
