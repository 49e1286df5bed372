//! Per-identity serialization of reconcile passes

use super::cluster::ObjectKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

/// One async mutex per [`ObjectKey`]. Slots are dropped once no pass holds
/// or waits on them.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<HashMap<ObjectKey, Slot>>>,
}

/// Held for the duration of one reconcile pass
pub struct KeyGuard {
    key: ObjectKey,
    slots: Arc<Mutex<HashMap<ObjectKey, Slot>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &ObjectKey) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Number of identities with a live slot
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the map entry is the only other reference
        // when nobody is waiting.
        self.guard.take();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_one_at_a_time() {
        let locks = Arc::new(KeyedLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let key = ObjectKey::new("default", "web");

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (locks, active, peak, key) =
                (locks.clone(), active.clone(), peak.clone(), key.clone());
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&ObjectKey::new("default", "a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&ObjectKey::new("default", "b")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
