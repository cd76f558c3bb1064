//! Object storage for original and processed images.

pub mod breaker;

use crate::error::{PipelineError, Result};
use breaker::{BreakerConfig, CircuitBreaker};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

pub use breaker::BreakerState;

/// Blocking key/value blob store. Callers on the async runtime go through
/// `spawn_blocking`.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Reject absolute keys and keys escaping the store root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(PipelineError::validation("object key is empty"));
    }
    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(PipelineError::validation(format!(
            "object key '{key}' must be a relative path inside the store"
        )));
    }
    Ok(())
}

/// Files under a root directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ObjectStore for LocalObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let path = self.root.join(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::not_found(format!("object '{key}'")))
            }
            Err(e) => Err(PipelineError::storage(format!("reading '{key}': {e}"))),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::storage(format!("creating '{}': {e}", parent.display())))?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| PipelineError::storage(format!("writing '{key}': {e}")))
    }
}

/// In-process store, for tests and dry runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let objects = self
            .objects
            .read()
            .map_err(|_| PipelineError::storage("memory store lock poisoned"))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::not_found(format!("object '{key}'")))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut objects = self
            .objects
            .write()
            .map_err(|_| PipelineError::storage("memory store lock poisoned"))?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Wraps a store with a circuit breaker. Only service failures count
/// against the breaker; missing objects and bad keys do not.
pub struct GuardedStore {
    inner: Arc<dyn ObjectStore>,
    breaker: CircuitBreaker,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn ObjectStore>, config: BreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new("object-storage", config),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    fn call<T>(&self, op: impl FnOnce(&dyn ObjectStore) -> Result<T>) -> Result<T> {
        if !self.breaker.allow() {
            return Err(PipelineError::ExternalService {
                service: "object-storage".to_string(),
                message: "circuit breaker is open".to_string(),
                retryable: true,
            });
        }
        let result = op(self.inner.as_ref());
        match &result {
            Err(PipelineError::ExternalService { .. }) => self.breaker.record_failure(),
            _ => self.breaker.record_success(),
        }
        result
    }
}

impl ObjectStore for GuardedStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.call(|store| store.get(key))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.call(|store| store.put(key, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DownStore {
        calls: AtomicUsize,
    }

    impl ObjectStore for DownStore {
        fn get(&self, _key: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::storage("connection refused"))
        }

        fn put(&self, _key: &str, _bytes: &[u8]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::storage("connection refused"))
        }
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("uploads/a.jpg").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("a/../../b").is_err());
    }

    #[test]
    fn test_memory_store_rejects_unsafe_keys() {
        let store = MemoryObjectStore::new();
        store.put("uploads/a.jpg", b"x").unwrap();
        assert_eq!(store.get("uploads/a.jpg").unwrap(), b"x");
        let err = store.get("../uploads/a.jpg").unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        let err = store.get("missing.jpg").unwrap_err();
        assert!(matches!(err, PipelineError::ResourceNotFound(_)));
    }

    #[test]
    fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("processed/s1.json", b"{}").unwrap();
        assert_eq!(store.get("processed/s1.json").unwrap(), b"{}");
        let err = store.get("missing.jpg").unwrap_err();
        assert!(matches!(err, PipelineError::ResourceNotFound(_)));
    }

    #[test]
    fn test_guarded_store_opens_and_short_circuits() {
        let down = Arc::new(DownStore {
            calls: AtomicUsize::new(0),
        });
        let store = GuardedStore::new(down.clone(), BreakerConfig::default());
        for _ in 0..5 {
            assert!(store.get("a").is_err());
        }
        assert_eq!(store.breaker_state(), BreakerState::Open);

        let err = store.get("a").unwrap_err();
        assert!(err.is_transient());
        assert_eq!(down.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_missing_objects_do_not_trip_breaker() {
        let store = GuardedStore::new(Arc::new(MemoryObjectStore::new()), BreakerConfig::default());
        for _ in 0..10 {
            assert!(store.get("nope").is_err());
        }
        assert_eq!(store.breaker_state(), BreakerState::Closed);
    }
}
