//! Single-flight registry: at most one in-progress run per guard key.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

#[derive(Debug, Default)]
pub struct SourceGuard {
    in_progress: Mutex<HashSet<String>>,
}

impl SourceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomic insert-if-absent. `false` means another run holds the key.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.keys().insert(key.to_string())
    }

    pub fn release(&self, key: &str) {
        if self.keys().remove(key) {
            debug!(key, "guard released");
        }
    }

    /// Scoped acquisition; the key is released when the lease drops.
    pub fn lease(self: &Arc<Self>, key: &str) -> Option<GuardLease> {
        self.try_acquire(key).then(|| GuardLease {
            guard: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.keys().contains(key)
    }

    pub fn in_progress(&self) -> Vec<String> {
        let mut keys = self.keys().iter().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.keys().clear();
    }
}

#[derive(Debug)]
pub struct GuardLease {
    guard: Arc<SourceGuard>,
    key: String,
}

impl GuardLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        self.guard.release(&self.key);
    }
}
