//! Observability sink consumed by the engine.
//!
//! The engine's state transitions are identical under [`NoopMetrics`];
//! sinks only observe. [`InMemoryMetrics`] keeps everything in process
//! for tests and embedders that want to inspect counters directly.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub const PUBLISH_COUNT: &str = "eventbus.publish.count";
pub const PROCESS_COUNT: &str = "eventbus.process.count";
pub const PUBLISH_LATENCY: &str = "eventbus.publish.latency";
pub const PROCESS_LATENCY: &str = "eventbus.process.latency";
pub const QUEUE_SIZE: &str = "eventbus.queue.size";
pub const ERROR_COUNT: &str = "eventbus.errors";

pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, attributes: &[(&str, &str)]);
    fn record_gauge(&self, name: &str, value: i64, attributes: &[(&str, &str)]);
    fn record_histogram(&self, name: &str, value: f64, attributes: &[(&str, &str)]);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _attributes: &[(&str, &str)]) {}
    fn record_gauge(&self, _name: &str, _value: i64, _attributes: &[(&str, &str)]) {}
    fn record_histogram(&self, _name: &str, _value: f64, _attributes: &[(&str, &str)]) {}
}

/// Mutex-guarded in-process store, keyed by metric name plus attributes.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, i64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, attributes: &[(&str, &str)]) -> String {
        if attributes.is_empty() {
            return name.to_string();
        }
        let attrs: Vec<String> = attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}{{{}}}", name, attrs.join(","))
    }

    pub fn counter(&self, name: &str, attributes: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(name, attributes))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, attributes: &[(&str, &str)]) -> Option<i64> {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(name, attributes))
            .copied()
    }

    pub fn histogram_count(&self, name: &str, attributes: &[(&str, &str)]) -> usize {
        self.histograms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(name, attributes))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr_counter(&self, name: &str, attributes: &[(&str, &str)]) {
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(Self::key(name, attributes))
            .or_insert(0) += 1;
    }

    fn record_gauge(&self, name: &str, value: i64, attributes: &[(&str, &str)]) {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(name, attributes), value);
    }

    fn record_histogram(&self, name: &str, value: f64, attributes: &[(&str, &str)]) {
        self.histograms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(Self::key(name, attributes))
            .or_default()
            .push(value);
    }
}
