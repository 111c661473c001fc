//! Per-key single-flight locks
//!
//! The kube-rs controller never runs two reconciles for the same object at
//! once, but `reconcile_key` is also callable directly. Holding the key's
//! mutex for the whole pass keeps that guarantee for every caller.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutex per reconcile key
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock for `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        mutex.lock_owned().await
    }

    /// Drop the entry for `key` unless someone is holding or waiting on it
    pub fn forget(&self, key: &str) {
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
