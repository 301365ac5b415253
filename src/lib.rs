//! Resilient serving layer for machine-learning prediction backends.
//!
//! The crate wraps flaky model loading and inference with the guardrails a
//! production gateway needs, composed behind one façade:
//!
//! | Module | Concern |
//! |--------|---------|
//! | [`resilience`] | Circuit breakers, retry with backoff, rate limiting |
//! | [`cache`] | Deterministic request keys, bounded LRU+TTL result cache |
//! | [`dedup`] | Single-flight coalescing of identical in-flight requests |
//! | [`batch`] | Micro-batching of individual items into vectorized calls |
//! | [`pool`] | Bounded pooling of reusable backend connections |
//! | [`health`] | Per-model health verdicts and latency percentiles |
//! | [`metrics`] | Prometheus collectors over an injectable registry |
//! | [`model`] | `Model` / `ModelLoader` traits and prediction types |
//! | [`gateway`] | The serving façade tying the layers together |
//! | [`telemetry`] | Tracing subscriber setup for embedders |
//!
//! # Example
//!
//! ```no_run
//! use modelgate::{Gateway, GatewayConfig};
//! use modelgate::model::ModelLoader;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run(loader: Arc<dyn ModelLoader>) -> modelgate::Result<()> {
//! let gateway = Gateway::builder()
//!     .with_config(GatewayConfig::default())
//!     .with_loader(loader)
//!     .build()?;
//!
//! let prediction = gateway
//!     .serve("sentiment", &json!({"text": "all good"}), "client-1")
//!     .await?;
//! println!("{} ({:.2})", prediction.output, prediction.confidence);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod resilience;
pub mod telemetry;

pub use config::GatewayConfig;
pub use error::{Error, ErrorContext, Result};
pub use gateway::{Gateway, GatewayBuilder, ReadinessReport};
pub use model::{Model, ModelKey, ModelLoader, Prediction};
