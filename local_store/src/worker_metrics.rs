use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::warn;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use write_lib::{MetricsSink, WriteError, WriteResult};

/// Prometheus-backed named counters. Each metric name gets one counter family
/// labelled by worker, created on first use.
pub struct WorkerMetrics {
    registry: Registry,
    worker: String,
    counters: Mutex<HashMap<String, IntCounterVec>>,
}

impl WorkerMetrics {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            registry: Registry::new(),
            worker: worker.into(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn counter(&self, name: &str) -> Option<IntCounterVec> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(counter) = counters.get(name) {
            return Some(counter.clone());
        }
        let opts = Opts::new(name, format!("{} counter", name));
        let counter = match IntCounterVec::new(opts, &["worker"]) {
            Ok(counter) => counter,
            Err(e) => {
                warn!("WorkerMetrics: create counter {} failed: {}", name, e);
                return None;
            }
        };
        if let Err(e) = self.registry.register(Box::new(counter.clone())) {
            warn!("WorkerMetrics: register counter {} failed: {}", name, e);
            return None;
        }
        counters.insert(name.to_string(), counter.clone());
        Some(counter)
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .get(name)
            .map(|c| c.with_label_values(&[self.worker.as_str()]).get())
            .unwrap_or(0)
    }

    pub fn encode_text(&self) -> WriteResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| WriteError::InvalidState(format!("encode metrics failed: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| WriteError::InvalidState(format!("encode metrics failed: {}", e)))
    }
}

impl MetricsSink for WorkerMetrics {
    fn inc_counter(&self, name: &str, value: u64) {
        if let Some(counter) = self.counter(name) {
            counter.with_label_values(&[self.worker.as_str()]).inc_by(value);
        }
    }
}
