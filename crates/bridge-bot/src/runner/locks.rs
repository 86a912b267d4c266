//! Session-lock registry (C2): maps a resume token's lock key to a mutex,
//! shared by every concurrent invocation carrying an equal token, reclaimed
//! once nothing holds or references it.
//!
//! Rust has no weak-valued concurrent map, so entries are `Weak<Mutex<()>>`
//! in a table guarded by a plain `std::sync::Mutex`; `lock_for` upgrades an
//! existing weak reference or inserts a fresh one, pruning dead entries
//! opportunistically on insert.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct LockRegistry {
    table: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex associated with `key`, creating it if necessary.
    /// Equal keys always observe the same mutex while any holder/reference
    /// is outstanding.
    fn lock_handle(&self, key: &str) -> Arc<Mutex<()>> {
        let mut table = self.table.lock().expect("lock registry poisoned");
        if let Some(existing) = table.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let fresh = Arc::new(Mutex::new(()));
        table.insert(key.to_string(), Arc::downgrade(&fresh));
        table.retain(|_, weak| weak.strong_count() > 0);
        fresh
    }

    /// Acquires the mutex for `key`, holding it until the returned guard is
    /// dropped. The guard owns a strong reference to the underlying mutex,
    /// so the entry cannot be reclaimed while the lock is held.
    pub async fn lock_for(&self, key: &str) -> OwnedMutexGuard<()> {
        let handle = self.lock_handle(key);
        handle.lock_owned().await
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.table.lock().expect("lock registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::LockRegistry;

    #[tokio::test]
    async fn equal_keys_share_the_same_mutex() {
        let registry = Arc::new(LockRegistry::new());
        let guard = registry.lock_for("codex:sess-1").await;

        let registry2 = Arc::clone(&registry);
        let second = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let _guard = registry2.lock_for("codex:sess-1").await;
            start.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        let waited = second.await.unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let registry = LockRegistry::new();
        let a = registry.lock_for("codex:sess-1").await;
        let b = tokio::time::timeout(Duration::from_millis(200), registry.lock_for("codex:sess-2"))
            .await;
        assert!(b.is_ok());
        drop(a);
    }

    #[tokio::test]
    async fn unreferenced_entries_are_reclaimed() {
        let registry = LockRegistry::new();
        {
            let _guard = registry.lock_for("codex:sess-1").await;
            assert_eq!(registry.entry_count(), 1);
        }
        // next insert opportunistically prunes dead entries
        let _guard = registry.lock_for("codex:sess-2").await;
        assert_eq!(registry.entry_count(), 1);
    }
}
