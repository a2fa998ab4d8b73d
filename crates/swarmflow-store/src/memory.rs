use std::collections::BTreeMap;
use std::sync::Mutex;

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::traits::CheckpointBackend;

/// Process-local backend. Contents vanish with the process.
#[derive(Default)]
pub struct InMemoryBackend {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|e| SwarmError::LockPoisoned(e.to_string()))
    }
}

impl CheckpointBackend for InMemoryBackend {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.lock()?.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_prefix_scoped_and_sorted() {
        let backend = InMemoryBackend::new();
        backend.put("run/b/2", b"x").unwrap();
        backend.put("run/a/1", b"x").unwrap();
        backend.put("run/b/1", b"x").unwrap();
        backend.put("other", b"x").unwrap();
        assert_eq!(backend.list("run/b/").unwrap(), vec!["run/b/1", "run/b/2"]);
        assert_eq!(backend.list("run/").unwrap().len(), 3);
        assert_eq!(backend.get("run/a/1").unwrap(), Some(b"x".to_vec()));
        assert_eq!(backend.get("missing").unwrap(), None);
    }
}
