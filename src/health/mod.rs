//! Per-model health accounting.
//!
//! Every prediction outcome feeds a running error rate and incremental
//! mean latency; a model's verdict is derived on read against configurable
//! thresholds. A separate tracker keeps a bounded rolling sample per model
//! for latency percentiles and confidence statistics.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Error-rate ceiling above which a model is unhealthy.
    pub max_error_rate: f64,
    /// Mean-latency ceiling above which a model is degraded.
    pub max_avg_latency: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.1,
            max_avg_latency: Duration::from_secs(5),
        }
    }
}

impl HealthThresholds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_error_rate(mut self, rate: f64) -> Self {
        self.max_error_rate = rate;
        self
    }

    pub fn with_max_avg_latency(mut self, latency: Duration) -> Self {
        self.max_avg_latency = latency;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unhealthy,
    NotLoaded,
    /// Never registered with the monitor.
    Unknown,
}

/// Point-in-time health for one model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelHealth {
    pub model: String,
    pub verdict: HealthVerdict,
    pub loaded: bool,
    pub total_predictions: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub load_failures: u64,
    /// Duration of the most recent successful load, in ms.
    pub load_time_ms: Option<f64>,
}

#[derive(Debug, Default)]
struct Stats {
    loaded: bool,
    total: u64,
    errors: u64,
    avg_latency_ms: f64,
    load_failures: u64,
    load_time_ms: Option<f64>,
}

impl Stats {
    fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.errors as f64 / self.total as f64
        }
    }
}

pub struct HealthMonitor {
    thresholds: HealthThresholds,
    models: RwLock<HashMap<String, Stats>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Record the outcome of a load attempt. The loaded flag always follows
    /// the latest attempt, so a failed reload marks the model not loaded
    /// even if an earlier load succeeded. Never touches prediction
    /// counters.
    pub fn record_load(&self, model: &str, success: bool, load_time: Duration) {
        let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
        let stats = map.entry(model.to_string()).or_default();
        stats.loaded = success;
        if success {
            stats.load_time_ms = Some(load_time.as_secs_f64() * 1000.0);
        } else {
            stats.load_failures += 1;
            warn!(
                model,
                load_failures = stats.load_failures,
                "model load failed"
            );
        }
    }

    pub fn mark_unloaded(&self, model: &str) {
        let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
        if let Some(stats) = map.get_mut(model) {
            stats.loaded = false;
        }
    }

    /// Fold one prediction outcome into the model's running stats. The
    /// mean latency updates incrementally: avg' = (avg*(n-1) + x) / n.
    pub fn record_prediction(&self, model: &str, latency: Duration, success: bool) {
        let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
        let stats = map.entry(model.to_string()).or_default();
        stats.total += 1;
        if !success {
            stats.errors += 1;
        }
        let x = latency.as_secs_f64() * 1000.0;
        let n = stats.total as f64;
        stats.avg_latency_ms = (stats.avg_latency_ms * (n - 1.0) + x) / n;

        let rate = stats.error_rate();
        if rate > self.thresholds.max_error_rate {
            warn!(model, error_rate = rate, "model error rate above threshold");
        }
    }

    fn verdict_for(&self, stats: &Stats) -> HealthVerdict {
        if !stats.loaded {
            HealthVerdict::NotLoaded
        } else if stats.error_rate() > self.thresholds.max_error_rate {
            HealthVerdict::Unhealthy
        } else if stats.avg_latency_ms > self.thresholds.max_avg_latency.as_secs_f64() * 1000.0 {
            HealthVerdict::Degraded
        } else {
            HealthVerdict::Healthy
        }
    }

    fn health_from(&self, model: &str, stats: &Stats) -> ModelHealth {
        ModelHealth {
            model: model.to_string(),
            verdict: self.verdict_for(stats),
            loaded: stats.loaded,
            total_predictions: stats.total,
            error_count: stats.errors,
            error_rate: stats.error_rate(),
            avg_latency_ms: stats.avg_latency_ms,
            load_failures: stats.load_failures,
            load_time_ms: stats.load_time_ms,
        }
    }

    /// Health for one model. A model never registered reports `Unknown`.
    pub fn status(&self, model: &str) -> ModelHealth {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        match map.get(model) {
            Some(stats) => self.health_from(model, stats),
            None => {
                let mut health = self.health_from(model, &Stats::default());
                health.verdict = HealthVerdict::Unknown;
                health
            }
        }
    }

    pub fn all_statuses(&self) -> Vec<ModelHealth> {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = map
            .iter()
            .map(|(name, stats)| self.health_from(name, stats))
            .collect();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency_ms: f64,
    /// Absent for failed predictions, which carry no confidence score.
    confidence: Option<f64>,
}

/// Rolling prediction statistics per model. Keeps the most recent
/// `capacity` observations for each.
pub struct PredictionTracker {
    capacity: usize,
    models: RwLock<HashMap<String, Arc<Mutex<VecDeque<Sample>>>>>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TrackerSummary {
    pub count: usize,
    pub avg_latency_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub avg_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
}

impl Default for PredictionTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl PredictionTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            models: RwLock::new(HashMap::new()),
        }
    }

    fn slot_for(&self, model: &str) -> Arc<Mutex<VecDeque<Sample>>> {
        if let Ok(map) = self.models.read() {
            if let Some(slot) = map.get(model) {
                return Arc::clone(slot);
            }
        }
        let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(model.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(VecDeque::with_capacity(self.capacity)))
        }))
    }

    pub fn record(&self, model: &str, latency: Duration, confidence: Option<f64>) {
        let slot = self.slot_for(model);
        let mut samples = slot.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(Sample {
            latency_ms: latency.as_secs_f64() * 1000.0,
            confidence,
        });
    }

    pub fn summary(&self, model: &str) -> TrackerSummary {
        let slot = self.slot_for(model);
        let samples = slot.lock().unwrap_or_else(|e| e.into_inner());
        summarize(samples.iter())
    }

    /// Summary merged across every tracked model.
    pub fn overall(&self) -> TrackerSummary {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut merged = Vec::new();
        for slot in map.values() {
            let samples = slot.lock().unwrap_or_else(|e| e.into_inner());
            merged.extend(samples.iter().copied());
        }
        summarize(merged.iter())
    }
}

fn summarize<'a>(samples: impl Iterator<Item = &'a Sample>) -> TrackerSummary {
    let samples: Vec<&Sample> = samples.collect();
    if samples.is_empty() {
        return TrackerSummary::default();
    }

    let mut latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let avg_latency_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;

    let confidences: Vec<f64> = samples.iter().filter_map(|s| s.confidence).collect();
    let (avg_c, min_c, max_c) = if confidences.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let sum: f64 = confidences.iter().sum();
        let min = confidences.iter().copied().fold(f64::INFINITY, f64::min);
        let max = confidences.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (sum / confidences.len() as f64, min, max)
    };

    TrackerSummary {
        count: samples.len(),
        avg_latency_ms,
        p50_ms: percentile(&latencies, 0.50),
        p95_ms: percentile(&latencies, 0.95),
        p99_ms: percentile(&latencies, 0.99),
        avg_confidence: avg_c,
        min_confidence: min_c,
        max_confidence: max_c,
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
