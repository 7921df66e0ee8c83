use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Lease, LockError, LockProvider};

/// Process-local lock provider for tests/dev and single-node deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockProvider {
    held: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().map(|h| h.contains(key)).unwrap_or(false)
    }
}

struct HeldKey {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for HeldKey {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn try_acquire(&self, key: &str) -> Result<Option<Lease>, LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        if !held.insert(key.to_string()) {
            return Ok(None);
        }
        drop(held);

        let guard = HeldKey {
            key: key.to_string(),
            held: self.held.clone(),
        };
        Ok(Some(Lease::new(key, guard)))
    }
}
