//! Cache key derivation.
//!
//! The default strategy fingerprints a request as
//! `method ":" hex(sha256(canonical_json(message)))`. Serialization goes
//! through `serde_json`, whose object maps are key-ordered, so two
//! semantically equal messages always produce the same digest regardless
//! of how they were assembled. Key derivation is deterministic and
//! side-effect free.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Status;

/// Derives cache keys from `(method, request message)` pairs.
pub trait KeyGenerator: Send + Sync {
    /// Produces the cache key. Two semantically equal requests to the same
    /// method must yield the same key.
    fn key(&self, method: &str, message: &Value) -> Result<String, Status>;
}

/// The default content-addressed strategy: method path plus a SHA-256
/// digest of the canonically serialized message.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintKeyGenerator;

impl FingerprintKeyGenerator {
    /// Creates the generator.
    pub fn new() -> Self {
        Self
    }
}

impl KeyGenerator for FingerprintKeyGenerator {
    fn key(&self, method: &str, message: &Value) -> Result<String, Status> {
        let canonical = serde_json::to_vec(message)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(format!("{}:{}", method, hex::encode(hasher.finalize())))
    }
}

/// Keys by method alone; suitable for parameterless methods.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodOnlyKeyGenerator;

impl MethodOnlyKeyGenerator {
    /// Creates the generator.
    pub fn new() -> Self {
        Self
    }
}

impl KeyGenerator for MethodOnlyKeyGenerator {
    fn key(&self, method: &str, _message: &Value) -> Result<String, Status> {
        Ok(method.to_string())
    }
}

/// Wraps a user-supplied derivation function.
#[derive(Clone)]
pub struct FnKeyGenerator {
    derive: Arc<dyn Fn(&str, &Value) -> Result<String, Status> + Send + Sync>,
}

impl FnKeyGenerator {
    /// Creates a generator from `derive`.
    pub fn new<F>(derive: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<String, Status> + Send + Sync + 'static,
    {
        Self {
            derive: Arc::new(derive),
        }
    }
}

impl std::fmt::Debug for FnKeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnKeyGenerator").finish()
    }
}

impl KeyGenerator for FnKeyGenerator {
    fn key(&self, method: &str, message: &Value) -> Result<String, Status> {
        (self.derive)(method, message)
    }
}

/// Dispatches to per-method generators with a fallback.
pub struct PerMethodKeyGenerator {
    fallback: Arc<dyn KeyGenerator>,
    by_method: HashMap<String, Arc<dyn KeyGenerator>>,
}

impl PerMethodKeyGenerator {
    /// Creates a dispatcher that falls back to `fallback` for unregistered
    /// methods.
    pub fn new(fallback: Arc<dyn KeyGenerator>) -> Self {
        Self {
            fallback,
            by_method: HashMap::new(),
        }
    }

    /// Registers a generator for one method.
    pub fn register(mut self, method: impl Into<String>, generator: Arc<dyn KeyGenerator>) -> Self {
        self.by_method.insert(method.into(), generator);
        self
    }
}

impl std::fmt::Debug for PerMethodKeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerMethodKeyGenerator")
            .field("methods", &self.by_method.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeyGenerator for PerMethodKeyGenerator {
    fn key(&self, method: &str, message: &Value) -> Result<String, Status> {
        match self.by_method.get(method) {
            Some(generator) => generator.key(method, message),
            None => self.fallback.key(method, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_deterministic() {
        let generator = FingerprintKeyGenerator::new();
        let a = generator.key("/t.T/Get", &json!({"id": 1})).unwrap();
        let b = generator.key("/t.T/Get", &json!({"id": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_is_stable_across_field_insertion_order() {
        let generator = FingerprintKeyGenerator::new();

        let mut first = serde_json::Map::new();
        first.insert("a".to_string(), json!(1));
        first.insert("b".to_string(), json!(2));

        let mut second = serde_json::Map::new();
        second.insert("b".to_string(), json!(2));
        second.insert("a".to_string(), json!(1));

        let a = generator.key("/t.T/Get", &Value::Object(first)).unwrap();
        let b = generator.key("/t.T/Get", &Value::Object(second)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_method_and_message() {
        let generator = FingerprintKeyGenerator::new();
        let base = generator.key("/t.T/Get", &json!({"id": 1})).unwrap();

        assert_ne!(base, generator.key("/t.T/List", &json!({"id": 1})).unwrap());
        assert_ne!(base, generator.key("/t.T/Get", &json!({"id": 2})).unwrap());
    }

    #[test]
    fn fingerprint_shape_is_method_colon_digest() {
        let generator = FingerprintKeyGenerator::new();
        let key = generator.key("/t.T/Get", &json!(null)).unwrap();
        let (method, digest) = key.split_once(':').unwrap();
        assert_eq!(method, "/t.T/Get");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn per_method_dispatch_falls_back() {
        let dispatcher = PerMethodKeyGenerator::new(Arc::new(FingerprintKeyGenerator::new()))
            .register("/t.T/Static", Arc::new(MethodOnlyKeyGenerator::new()));

        let static_key = dispatcher.key("/t.T/Static", &json!({"x": 1})).unwrap();
        assert_eq!(static_key, "/t.T/Static");

        let dynamic_key = dispatcher.key("/t.T/Get", &json!({"x": 1})).unwrap();
        assert!(dynamic_key.starts_with("/t.T/Get:"));
    }

    #[test]
    fn custom_function_generator() {
        let generator =
            FnKeyGenerator::new(|method, message| Ok(format!("{method}|{message}")));
        assert_eq!(
            generator.key("/t.T/Get", &json!(5)).unwrap(),
            "/t.T/Get|5"
        );
    }
}
