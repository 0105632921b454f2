//! In-process implementation of [`KvStore`].
//!
//! Every operation runs under one mutex, which gives the same all-or-nothing
//! behaviour the Redis scripts provide. Expiry is tracked on
//! `tokio::time::Instant`, so tests can drive TTLs with a paused clock.
//! State is lost when the process exits.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::kv_store::{KvStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    List(VecDeque<String>),
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

/// A [`KvStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one field of a hash, creating the hash if needed. Used to seed
    /// the connection-routing table.
    pub fn set_hash_field(&self, key: &str, field: &str, value: &str) {
        let mut slots = self.lock_slots();
        let now = Instant::now();
        evict_expired(&mut slots, key, now);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Value::Hash(map) = &mut slot.value {
            map.insert(field.to_string(), value.to_string());
        }
    }

    /// Stores a plain string value with an optional TTL.
    pub fn set_text(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut slots = self.lock_slots();
        slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Returns the string value at `key`, if present and not expired.
    pub fn get_text(&self, key: &str) -> Option<String> {
        let mut slots = self.lock_slots();
        evict_expired(&mut slots, key, Instant::now());
        match slots.get(key).map(|slot| &slot.value) {
            Some(Value::Text(text)) => Some(text.clone()),
            _ => None,
        }
    }

    /// Returns `true` when `key` exists and has not expired.
    pub fn contains_key(&self, key: &str) -> bool {
        let mut slots = self.lock_slots();
        evict_expired(&mut slots, key, Instant::now());
        slots.contains_key(key)
    }

    /// Remaining time to live of `key`, if it exists and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut slots = self.lock_slots();
        let now = Instant::now();
        evict_expired(&mut slots, key, now);
        slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Removes `key` unconditionally.
    pub fn remove(&self, key: &str) {
        self.lock_slots().remove(key);
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // A panic while holding the guard leaves plain data behind; keep serving it.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn evict_expired(slots: &mut HashMap<String, Slot>, key: &str, now: Instant) {
    let expired = slots
        .get(key)
        .and_then(|slot| slot.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        slots.remove(key);
    }
}

fn trim(list: &mut VecDeque<String>, max_len: usize) {
    if max_len > 0 {
        list.truncate(max_len);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn read_list_refresh(&self, key: &str, ttl: Duration) -> StoreResult<Option<Vec<String>>> {
        let mut slots = self.lock_slots();
        let now = Instant::now();
        evict_expired(&mut slots, key, now);
        match slots.get_mut(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::List(list) => {
                    let entries = list.iter().cloned().collect();
                    slot.expires_at = Some(now + ttl);
                    Ok(Some(entries))
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            },
        }
    }

    async fn prepend_list(&self, key: &str, value: String, ttl: Duration, max_len: usize) -> StoreResult<()> {
        let mut slots = self.lock_slots();
        let now = Instant::now();
        evict_expired(&mut slots, key, now);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::List(list) => {
                list.push_front(value);
                trim(list, max_len);
                slot.expires_at = Some(now + ttl);
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn replace_list(&self, key: &str, values: Vec<String>, ttl: Duration, max_len: usize) -> StoreResult<()> {
        let mut slots = self.lock_slots();
        slots.remove(key);
        if values.is_empty() {
            return Ok(());
        }
        let mut list: VecDeque<String> = values.into();
        trim(&mut list, max_len);
        slots.insert(
            key.to_string(),
            Slot {
                value: Value::List(list),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut slots = self.lock_slots();
        let now = Instant::now();
        evict_expired(&mut slots, key, now);
        if slots.contains_key(key) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(token.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, token: &str) -> StoreResult<bool> {
        let mut slots = self.lock_slots();
        evict_expired(&mut slots, key, Instant::now());
        let held_by_caller = matches!(
            slots.get(key).map(|slot| &slot.value),
            Some(Value::Text(current)) if current == token
        );
        if held_by_caller {
            slots.remove(key);
        }
        Ok(held_by_caller)
    }

    async fn hash_get_many(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        let mut slots = self.lock_slots();
        evict_expired(&mut slots, key, Instant::now());
        match slots.get(key).map(|slot| &slot.value) {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(map)) => Ok(fields.iter().map(|field| map.get(field).cloned()).collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}
