//! Per-request mutual exclusion
//!
//! Every read-modify-write of a channel request and its HTLCs happens under
//! that request's lock. Lock order: request lock, then the funding
//! coordinator's node lock. Never the reverse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Async locks keyed by channel request ID
#[derive(Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, waiting while another task holds it
    pub async fn lock(&self, id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries only referenced by the table are idle
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.lock(1).await;

        let contender = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _guard = locks.lock(1).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _one = locks.lock(1).await;
        let _two = locks.lock(2).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = KeyedLocks::new();
        drop(locks.lock(1).await);
        drop(locks.lock(2).await);
        let _three = locks.lock(3).await;
        assert_eq!(locks.len(), 1);
    }
}
