//! The serving façade. Composes the resilience, caching, deduplication and
//! health components into a single `serve` path:
//!
//! validate → rate limit → cache key → single-flight { cache lookup →
//! load-if-needed → predict under retry+breaker → record health/metrics →
//! cache fill }.

use crate::cache::{CacheStats, KeyGenerator, LruTtlCache};
use crate::config::GatewayConfig;
use crate::dedup::{DedupStats, Deduplicator};
use crate::health::{HealthMonitor, ModelHealth, PredictionTracker, TrackerSummary};
use crate::metrics::GatewayMetrics;
use crate::model::{Model, ModelKey, ModelLoader, Prediction};
use crate::resilience::{BreakerRegistry, BreakerStatus, Retrier, SlidingWindowLimiter};
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info};

/// Aggregate readiness snapshot for operators and probes.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub models: Vec<ModelHealth>,
    pub breakers: Vec<BreakerStatus>,
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub latency: TrackerSummary,
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    loader: Option<Arc<dyn ModelLoader>>,
    metrics: Option<GatewayMetrics>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            loader: None,
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;
        let loader = self
            .loader
            .ok_or_else(|| Error::validation("gateway requires a model loader"))?;

        let mut keygen = KeyGenerator::new();
        if let Some(salt) = &self.config.cache_salt {
            keygen = keygen.with_salt(salt.clone());
        }

        Ok(Gateway {
            breakers: BreakerRegistry::new(self.config.breaker.clone()),
            retrier: Retrier::new(self.config.retry.clone()),
            limiter: SlidingWindowLimiter::new(self.config.rate_limiter.clone()),
            cache: LruTtlCache::new(self.config.cache.clone()),
            keygen,
            dedup: Deduplicator::new(),
            health: HealthMonitor::new(self.config.health.clone()),
            tracker: PredictionTracker::default(),
            metrics: self.metrics,
            loader,
            models: RwLock::new(HashMap::new()),
        })
    }
}

pub struct Gateway {
    breakers: BreakerRegistry,
    retrier: Retrier,
    limiter: SlidingWindowLimiter,
    cache: LruTtlCache<String, Prediction>,
    keygen: KeyGenerator,
    dedup: Deduplicator<Prediction>,
    health: HealthMonitor,
    tracker: PredictionTracker,
    metrics: Option<GatewayMetrics>,
    loader: Arc<dyn ModelLoader>,
    models: RwLock<HashMap<String, Arc<dyn Model>>>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Serve one prediction request.
    ///
    /// Rate limiting happens before deduplication, so a denied client does
    /// not ride along on another caller's in-flight request. Identical
    /// concurrent requests past the limiter coalesce into one execution.
    pub async fn serve(
        &self,
        model_name: &str,
        input: &Value,
        client_id: &str,
    ) -> Result<Prediction> {
        if let Err(e) = validate_request(model_name, input, client_id) {
            if let Some(m) = &self.metrics {
                m.record_error(model_name, &e);
            }
            return Err(e);
        }

        if let Err(e) = self.limiter.check_and_record(client_id) {
            if let Some(m) = &self.metrics {
                m.record_rate_limited();
            }
            return Err(e);
        }

        let key = self.keygen.key_for(model_name, input);
        let executed = AtomicBool::new(false);
        let result = self
            .dedup
            .run(&key, || {
                executed.store(true, Ordering::SeqCst);
                self.serve_uncoalesced(model_name, input, &key)
            })
            .await;

        if !executed.load(Ordering::SeqCst) {
            debug!(model = model_name, "request coalesced");
            if let Some(m) = &self.metrics {
                m.record_deduplicated();
            }
        }
        result
    }

    async fn serve_uncoalesced(
        &self,
        model_name: &str,
        input: &Value,
        key: &str,
    ) -> Result<Prediction> {
        if let Some(hit) = self.cache.get(key) {
            debug!(model = model_name, "serving prediction from cache");
            if let Some(m) = &self.metrics {
                m.record_cache_hit();
            }
            return Ok(hit);
        }
        if let Some(m) = &self.metrics {
            m.record_cache_miss();
        }

        let model = match self.model_for(model_name).await {
            Ok(model) => model,
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.record_error(model_name, &e);
                }
                return Err(e);
            }
        };
        let breaker = self.breakers.get(&format!("model:{}", model_name));

        let start = Instant::now();
        let result = self
            .retrier
            .call(|| {
                let breaker = Arc::clone(&breaker);
                let model = Arc::clone(&model);
                async move { breaker.call(|| model.predict(input)).await }
            })
            .await;
        let latency = start.elapsed();

        // Gated calls never reached the model, so they are not prediction
        // outcomes; counting them would make an unhealthy verdict
        // self-sustaining while the breaker is open.
        let gated = matches!(&result, Err(e) if e.is_circuit_open());
        if !gated {
            self.health
                .record_prediction(model_name, latency, result.is_ok());
            self.tracker.record(
                model_name,
                latency,
                result.as_ref().ok().map(|p| p.confidence),
            );
        }
        if let Some(m) = &self.metrics {
            m.set_breaker_state(breaker.name(), breaker.status().state);
            match &result {
                Ok(p) => m.record_success(model_name, latency, p.confidence),
                Err(e) => m.record_failure(model_name, e, latency),
            }
        }

        let prediction = result?;
        self.cache.set(key, prediction.clone());
        Ok(prediction)
    }

    /// Resolve a loaded model, loading the latest revision on first use.
    async fn model_for(&self, name: &str) -> Result<Arc<dyn Model>> {
        {
            let map = self.models.read().unwrap_or_else(|e| e.into_inner());
            if let Some(model) = map.get(name) {
                return Ok(Arc::clone(model));
            }
        }
        self.load_model(&ModelKey::latest(name)).await
    }

    /// Load a model through retry and its own load breaker, then register
    /// it for serving. Concurrent loads of the same model may both run;
    /// the later insert wins and the earlier handle stays valid.
    pub async fn load_model(&self, key: &ModelKey) -> Result<Arc<dyn Model>> {
        let breaker = self.breakers.get(&format!("load:{}", key.name));
        let loader = Arc::clone(&self.loader);

        let start = Instant::now();
        let loaded = self
            .retrier
            .call(|| {
                let breaker = Arc::clone(&breaker);
                let loader = Arc::clone(&loader);
                let key = key.clone();
                async move { breaker.call(|| async { loader.load(&key).await }).await }
            })
            .await
            .map_err(|e| {
                self.health.record_load(&key.name, false, start.elapsed());
                if e.is_circuit_open() {
                    e
                } else {
                    Error::ModelUnavailable {
                        model: key.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let active = {
            let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
            map.insert(key.name.clone(), Arc::clone(&loaded));
            map.len()
        };
        self.health.record_load(&key.name, true, start.elapsed());
        if let Some(m) = &self.metrics {
            m.set_active_models(active as i64);
        }
        info!(model = %key, load_ms = start.elapsed().as_millis() as u64, "model loaded");
        Ok(loaded)
    }

    /// Drop a model from serving. Cached predictions for it age out via TTL.
    pub fn unload_model(&self, name: &str) -> bool {
        let (removed, active) = {
            let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
            (map.remove(name).is_some(), map.len())
        };
        if removed {
            self.health.mark_unloaded(name);
            if let Some(m) = &self.metrics {
                m.set_active_models(active as i64);
            }
            info!(model = name, "model unloaded");
        }
        removed
    }

    pub fn loaded_models(&self) -> Vec<String> {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Readiness: at least one model loaded, none unhealthy, no breaker
    /// stuck open.
    pub fn readiness(&self) -> ReadinessReport {
        let models = self.health.all_statuses();
        let mut breakers: Vec<_> = self.breakers.all_statuses().into_values().collect();
        breakers.sort_by(|a, b| a.dependency.cmp(&b.dependency));

        let any_loaded = models.iter().any(|m| m.loaded);
        let none_unhealthy = models
            .iter()
            .all(|m| m.verdict != crate::health::HealthVerdict::Unhealthy);
        let none_open = breakers
            .iter()
            .all(|b| b.state != crate::resilience::CircuitState::Open);

        ReadinessReport {
            ready: any_loaded && none_unhealthy && none_open,
            models,
            breakers,
            cache: self.cache.stats(),
            dedup: self.dedup.stats(),
            latency: self.tracker.overall(),
        }
    }

    pub fn model_health(&self, name: &str) -> ModelHealth {
        self.health.status(name)
    }

    /// Rolling latency and confidence statistics for one model.
    pub fn prediction_summary(&self, name: &str) -> TrackerSummary {
        self.tracker.summary(name)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn breaker_statuses(&self) -> HashMap<String, BreakerStatus> {
        self.breakers.all_statuses()
    }

    /// Operator override: close every breaker.
    pub fn reset_breakers(&self) {
        self.breakers.reset_all();
    }

    /// Drop cached predictions, for example after a model redeploy.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }
}

fn validate_request(model_name: &str, input: &Value, client_id: &str) -> Result<()> {
    if model_name.is_empty() {
        return Err(Error::validation("model name must not be empty"));
    }
    if client_id.is_empty() {
        return Err(Error::validation("client id must not be empty"));
    }
    if input.is_null() {
        return Err(Error::validation("prediction input must not be null"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use async_trait::async_trait;
    use serde_json::json;

    struct NullLoader;

    #[async_trait]
    impl ModelLoader for NullLoader {
        async fn load(&self, key: &ModelKey) -> Result<Arc<dyn Model>> {
            Err(Error::ModelUnavailable {
                model: key.to_string(),
                message: "no artifacts".into(),
            })
        }
    }

    #[test]
    fn test_builder_requires_loader() {
        let err = match Gateway::builder().build() {
            Ok(_) => panic!("builder must fail without a loader"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_builder_validates_config() {
        let cfg = GatewayConfig::new()
            .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(0));
        let err = match Gateway::builder()
            .with_config(cfg)
            .with_loader(Arc::new(NullLoader))
            .build()
        {
            Ok(_) => panic!("builder must reject a zero failure threshold"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let gw = Gateway::builder()
            .with_loader(Arc::new(NullLoader))
            .build()
            .unwrap();
        assert!(gw.serve("", &json!({}), "c").await.is_err());
        assert!(gw.serve("m", &Value::Null, "c").await.is_err());
        assert!(gw.serve("m", &json!({}), "").await.is_err());
    }

    #[tokio::test]
    async fn test_unloadable_model_reports_unavailable() {
        let gw = Gateway::builder()
            .with_loader(Arc::new(NullLoader))
            .build()
            .unwrap();
        let err = gw.serve("ghost", &json!({"x": 1}), "c").await.unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable { .. }));
        assert!(!gw.readiness().ready);
    }
}
