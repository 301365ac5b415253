use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derives deterministic cache keys from prediction requests.
///
/// The key is the SHA-256 hex digest of the canonical JSON form of the
/// model name plus input payload. `serde_json` maps serialize with sorted
/// keys, so two semantically equal inputs with different field order hash
/// to the same key.
#[derive(Debug, Clone, Default)]
pub struct KeyGenerator {
    /// Optional namespace mixed into every key, to keep deployments that
    /// share a cache from colliding.
    salt: Option<String>,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn key_for(&self, model: &str, input: &Value) -> String {
        let mut canonical = serde_json::Map::new();
        canonical.insert("model".to_string(), Value::String(model.to_string()));
        canonical.insert("input".to_string(), input.clone());
        if let Some(salt) = &self.salt {
            canonical.insert("salt".to_string(), Value::String(salt.clone()));
        }
        let bytes = serde_json::to_vec(&Value::Object(canonical))
            .unwrap_or_else(|_| format!("{}:{}", model, input).into_bytes());

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_deterministic() {
        let gen = KeyGenerator::new();
        let input = json!({"text": "hello", "top_k": 3});
        assert_eq!(gen.key_for("clf-v1", &input), gen.key_for("clf-v1", &input));
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let gen = KeyGenerator::new();
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(gen.key_for("m", &a), gen.key_for("m", &b));
    }

    #[test]
    fn test_model_and_input_differentiate() {
        let gen = KeyGenerator::new();
        let input = json!({"x": 1});
        assert_ne!(gen.key_for("m1", &input), gen.key_for("m2", &input));
        assert_ne!(
            gen.key_for("m1", &json!({"x": 1})),
            gen.key_for("m1", &json!({"x": 2}))
        );
    }

    #[test]
    fn test_salt_namespaces_keys() {
        let plain = KeyGenerator::new();
        let salted = KeyGenerator::new().with_salt("staging");
        let input = json!({"x": 1});
        assert_ne!(plain.key_for("m", &input), salted.key_for("m", &input));
    }
}
