use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::EntityKey;

/// In-process keyed locks. Every read-modify-write of one entity's
/// detection or action holds that entity's lock.
#[derive(Default)]
pub struct EntityLocks {
    inner: Mutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &EntityKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.clone()).or_default())
        };
        slot.lock_owned().await
    }

    /// Forget keys nobody is holding or waiting on.
    pub fn prune(&self) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityType;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(EntityLocks::new());
        let key = EntityKey::new(EntityType::Lead, "l1");
        let guard = locks.lock(&key).await;

        let locks2 = Arc::clone(&locks);
        let key2 = key.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.lock(&key2).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = EntityLocks::new();
        let _a = locks.lock(&EntityKey::new(EntityType::Lead, "l1")).await;
        let _b = locks.lock(&EntityKey::new(EntityType::Lead, "l2")).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_held_keys() {
        let locks = EntityLocks::new();
        let held = locks.lock(&EntityKey::new(EntityType::Job, "j1")).await;
        drop(locks.lock(&EntityKey::new(EntityType::Job, "j2")).await);
        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
