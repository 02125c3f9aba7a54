//! Per-key async mutual exclusion.
//!
//! Handlers touching the same owner (or binding) serialize; handlers for
//! different keys never contend. Slots are dropped once nobody holds or waits
//! on them, so the map only tracks keys with live activity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Slots,
}

pub struct KeyGuard {
    key: String,
    slot: Arc<AsyncMutex<()>>,
    slots: Slots,
    _held: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let held = slot.clone().lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            slot,
            slots: self.slots.clone(),
            _held: held,
        }
    }

    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        // map + this guard's slot + the owned guard's Arc
        if Arc::strong_count(&self.slot) <= 3 {
            slots.remove(&self.key);
        }
    }
}
