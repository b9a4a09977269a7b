//! A small process-wide metrics registry: lock-free counters/gauges, and a
//! histogram under a cheap lock (spec section 5: "Shared mutable state").
//!
//! This does not export anywhere — wiring a Prometheus/OTel exporter onto
//! these values is the deployment host's job (spec section 1, out of scope).
//! What's in scope is giving every component a place to report into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Histogram {
    samples: Vec<f64>,
}

impl Histogram {
    fn record(&mut self, value: f64) {
        self.samples.push(value);
    }

    fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
        sorted.get(idx).copied()
    }
}

/// Process-wide counters/gauges/histograms, keyed by metric name with an
/// optional label suffix baked into the key (e.g. `"secrets_redacted:aws"`).
#[derive(Default)]
pub struct MetricsRegistry {
    counters: HashMap<&'static str, AtomicU64>,
    gauges: Mutex<HashMap<&'static str, i64>>,
    histograms: Mutex<HashMap<&'static str, Histogram>>,
    labeled_counters: Mutex<HashMap<String, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_counter(&self, name: &'static str) {
        self.incr_counter_by(name, 1);
    }

    pub fn incr_counter_by(&self, name: &'static str, n: u64) {
        // Counters are declared by first use; entries are created lazily
        // under the (rarely contended) labeled map below when a brand-new
        // name shows up, but the common path for known names is lock-free.
        if let Some(existing) = self.counters.get(name) {
            existing.fetch_add(n, Ordering::Relaxed);
        } else {
            let mut labeled = self.labeled_counters.lock().expect("metrics mutex poisoned");
            *labeled.entry(name.to_string()).or_insert(0) += n;
        }
    }

    /// Increment a counter with a dynamic label suffix, e.g. pattern-family
    /// labeled redaction counts (spec section 4.1: "Each redaction
    /// increments an observable counter with pattern-family label").
    pub fn incr_labeled(&self, name: &str, label: &str) {
        let key = format!("{name}:{label}");
        let mut labeled = self.labeled_counters.lock().expect("metrics mutex poisoned");
        *labeled.entry(key).or_insert(0) += 1;
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        if let Some(existing) = self.counters.get(name) {
            return existing.load(Ordering::Relaxed);
        }
        let labeled = self.labeled_counters.lock().expect("metrics mutex poisoned");
        labeled.get(name).copied().unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &'static str, value: i64) {
        let mut gauges = self.gauges.lock().expect("metrics mutex poisoned");
        gauges.insert(name, value);
    }

    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        let gauges = self.gauges.lock().expect("metrics mutex poisoned");
        gauges.get(name).copied()
    }

    pub fn record_latency(&self, name: &'static str, millis: f64) {
        let mut histograms = self.histograms.lock().expect("metrics mutex poisoned");
        histograms.entry(name).or_default().record(millis);
    }

    pub fn latency_p50(&self, name: &str) -> Option<f64> {
        let histograms = self.histograms.lock().expect("metrics mutex poisoned");
        histograms.get(name).and_then(|h| h.percentile(0.5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_counters_accumulate_independently() {
        let m = MetricsRegistry::new();
        m.incr_labeled("secrets_redacted", "aws_key");
        m.incr_labeled("secrets_redacted", "aws_key");
        m.incr_labeled("secrets_redacted", "jwt");
        assert_eq!(m.counter_value("secrets_redacted:aws_key"), 2);
        assert_eq!(m.counter_value("secrets_redacted:jwt"), 1);
    }

    #[test]
    fn histogram_percentile_is_order_independent() {
        let m = MetricsRegistry::new();
        for v in [10.0, 30.0, 20.0] {
            m.record_latency("clone_ms", v);
        }
        assert_eq!(m.latency_p50("clone_ms"), Some(20.0));
    }

    #[test]
    fn set_gauge_records_a_value_not_previously_seen() {
        let m = MetricsRegistry::new();
        assert_eq!(m.gauge_value("clone_cache_entries"), None);
        m.set_gauge("clone_cache_entries", 4);
        assert_eq!(m.gauge_value("clone_cache_entries"), Some(4));
        m.set_gauge("clone_cache_entries", 7);
        assert_eq!(m.gauge_value("clone_cache_entries"), Some(7));
    }
}
