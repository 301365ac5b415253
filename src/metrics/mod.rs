//! Prometheus instrumentation for the gateway.
//!
//! All collectors register against a caller-supplied `Registry`, so tests
//! and embedders can keep metric namespaces isolated.

use crate::resilience::CircuitState;
use crate::{Error, Result};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::time::Duration;

#[derive(Clone)]
pub struct GatewayMetrics {
    predictions_total: IntCounterVec,
    prediction_errors_total: IntCounterVec,
    prediction_latency_seconds: HistogramVec,
    prediction_confidence: Histogram,
    cache_hits_total: IntCounter,
    cache_misses_total: IntCounter,
    rate_limited_total: IntCounter,
    deduplicated_total: IntCounter,
    breaker_state: IntGaugeVec,
    active_models: IntGauge,
}

impl GatewayMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let predictions_total = IntCounterVec::new(
            Opts::new("gateway_predictions_total", "Predictions served, by outcome"),
            &["model", "status"],
        )
        .map_err(prom_err)?;
        let prediction_errors_total = IntCounterVec::new(
            Opts::new(
                "gateway_prediction_errors_total",
                "Prediction failures, by error kind",
            ),
            &["model", "kind"],
        )
        .map_err(prom_err)?;
        let prediction_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_prediction_latency_seconds",
                "End-to-end prediction latency",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["model"],
        )
        .map_err(prom_err)?;
        let prediction_confidence = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_prediction_confidence",
                "Confidence scores of served predictions",
            )
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
        )
        .map_err(prom_err)?;
        let cache_hits_total = IntCounter::new("gateway_cache_hits_total", "Prediction cache hits")
            .map_err(prom_err)?;
        let cache_misses_total =
            IntCounter::new("gateway_cache_misses_total", "Prediction cache misses")
                .map_err(prom_err)?;
        let rate_limited_total = IntCounter::new(
            "gateway_rate_limited_total",
            "Requests denied by the rate limiter",
        )
        .map_err(prom_err)?;
        let deduplicated_total = IntCounter::new(
            "gateway_deduplicated_total",
            "Requests coalesced onto an in-flight prediction",
        )
        .map_err(prom_err)?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "gateway_breaker_state",
                "Circuit state per dependency (0 closed, 1 half-open, 2 open)",
            ),
            &["dependency"],
        )
        .map_err(prom_err)?;
        let active_models =
            IntGauge::new("gateway_active_models", "Models currently loaded").map_err(prom_err)?;

        for c in [
            Box::new(predictions_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(prediction_errors_total.clone()),
            Box::new(prediction_latency_seconds.clone()),
            Box::new(prediction_confidence.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(deduplicated_total.clone()),
            Box::new(breaker_state.clone()),
            Box::new(active_models.clone()),
        ] {
            registry.register(c).map_err(prom_err)?;
        }

        Ok(Self {
            predictions_total,
            prediction_errors_total,
            prediction_latency_seconds,
            prediction_confidence,
            cache_hits_total,
            cache_misses_total,
            rate_limited_total,
            deduplicated_total,
            breaker_state,
            active_models,
        })
    }

    pub fn record_success(&self, model: &str, latency: Duration, confidence: f64) {
        self.predictions_total
            .with_label_values(&[model, "success"])
            .inc();
        self.prediction_latency_seconds
            .with_label_values(&[model])
            .observe(latency.as_secs_f64());
        self.prediction_confidence.observe(confidence);
    }

    pub fn record_failure(&self, model: &str, err: &Error, latency: Duration) {
        self.predictions_total
            .with_label_values(&[model, "error"])
            .inc();
        self.prediction_errors_total
            .with_label_values(&[model, err.kind()])
            .inc();
        self.prediction_latency_seconds
            .with_label_values(&[model])
            .observe(latency.as_secs_f64());
    }

    /// Count an error for a request that never reached the model, such as
    /// a validation rejection or a failed load. Unlike [`record_failure`],
    /// this does not touch the prediction counter or latency histogram.
    ///
    /// [`record_failure`]: Self::record_failure
    pub fn record_error(&self, model: &str, err: &Error) {
        self.prediction_errors_total
            .with_label_values(&[model, err.kind()])
            .inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated_total.inc();
    }

    pub fn set_breaker_state(&self, dependency: &str, state: CircuitState) {
        let v = match state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        self.breaker_state.with_label_values(&[dependency]).set(v);
    }

    pub fn set_active_models(&self, count: i64) {
        self.active_models.set(count);
    }
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::runtime(format!("metrics registration failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_against_fresh_registry() {
        let registry = Registry::new();
        let metrics = GatewayMetrics::new(&registry).unwrap();
        metrics.record_success("m", Duration::from_millis(12), 0.9);
        metrics.record_cache_hit();
        metrics.set_breaker_state("m", CircuitState::Open);

        let families = registry.gather();
        let names: Vec<_> = family_names(&families);
        assert!(names.contains(&"gateway_predictions_total"));
        assert!(names.contains(&"gateway_cache_hits_total"));
        assert!(names.contains(&"gateway_breaker_state"));
    }

    fn family_names(families: &[prometheus::proto::MetricFamily]) -> Vec<&str> {
        families.iter().map(|f| f.get_name()).collect()
    }

    #[test]
    fn test_double_registration_is_an_error() {
        let registry = Registry::new();
        let _first = GatewayMetrics::new(&registry).unwrap();
        assert!(GatewayMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_error_kind_labels() {
        let registry = Registry::new();
        let metrics = GatewayMetrics::new(&registry).unwrap();
        metrics.record_failure(
            "m",
            &Error::transient("blip"),
            Duration::from_millis(5),
        );
        let families = registry.gather();
        let errs = families
            .iter()
            .find(|f| f.get_name() == "gateway_prediction_errors_total")
            .unwrap();
        let labels = errs.get_metric()[0].get_label();
        assert!(labels
            .iter()
            .any(|l| l.get_name() == "kind" && l.get_value() == "transient"));
    }
}
