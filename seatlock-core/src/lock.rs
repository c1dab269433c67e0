use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::model::{SeatId, UserId};
use crate::StoreResult;

/// Key of the external lock guarding a seat.
pub fn seat_lock_key(seat: SeatId) -> String {
    format!("seat_lock:{}", seat)
}

/// Value recorded as the holder of a seat lock.
pub fn holder_token(user: UserId) -> String {
    format!("user:{}", user)
}

/// Key/value store with atomic set-if-absent-with-expiry.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Sets `key` to `holder` for `ttl` unless the key already exists.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool>;

    async fn holder(&self, key: &str) -> StoreResult<Option<String>>;

    async fn release(&self, key: &str) -> StoreResult<bool>;

    /// Deletes `key` only while it is still held by `holder`.
    async fn release_if_held(&self, key: &str, holder: &str) -> StoreResult<bool>;
}

/// In-process lock service. Entries expire lazily when touched.
#[derive(Default)]
pub struct MemoryLockService {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        f(&mut entries)
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        Ok(self.with_entries(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(key.to_string(), (holder.to_string(), Instant::now() + ttl));
            true
        }))
    }

    async fn holder(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.with_entries(|entries| entries.get(key).map(|(holder, _)| holder.clone())))
    }

    async fn release(&self, key: &str) -> StoreResult<bool> {
        Ok(self.with_entries(|entries| entries.remove(key).is_some()))
    }

    async fn release_if_held(&self, key: &str, holder: &str) -> StoreResult<bool> {
        Ok(self.with_entries(|entries| {
            let held = entries.get(key).is_some_and(|(current, _)| current == holder);
            if held {
                entries.remove(key);
            }
            held
        }))
    }
}
