//! Model abstractions the gateway serves through.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Identifies one loadable model artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub name: String,
    pub version: String,
}

impl ModelKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Key for the unpinned latest revision of a model.
    pub fn latest(name: impl Into<String>) -> Self {
        Self::new(name, "latest")
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// One served prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub model: String,
    pub output: Value,
    pub confidence: f64,
}

/// A loaded model ready to serve.
#[async_trait]
pub trait Model: Send + Sync {
    fn key(&self) -> &ModelKey;

    async fn predict(&self, input: &Value) -> Result<Prediction>;
}

/// Source of model artifacts. Loading may be slow or flaky; callers wrap
/// it in retry and circuit-breaking.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, key: &ModelKey) -> Result<Arc<dyn Model>>;
}
