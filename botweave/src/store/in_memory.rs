//! In-memory `KvStore` used by tests and the preview sandbox.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{KvError, KvStore};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// DashMap-backed store with lazy expiry.
#[derive(Default)]
pub struct InMemoryKv {
    map: DashMap<String, Entry>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(value: &str, ttl: Option<Duration>) -> Entry {
        Entry {
            value: value.to_string(),
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match self.map.get(key) {
            Some(e) if e.live() => Ok(Some(e.value.clone())),
            Some(_) => {
                drop(self.map.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.map.insert(key.to_string(), Self::entry(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.map.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        // DashMap entry API keeps the check-and-set under one shard lock.
        let mut won = false;
        match self.map.entry(key.to_string()) {
            dashmap::Entry::Occupied(mut occ) => {
                let current = occ.get().live().then(|| occ.get().value.clone());
                if current.as_deref() == expected {
                    occ.insert(Self::entry(new, ttl));
                    won = true;
                }
            }
            dashmap::Entry::Vacant(vac) => {
                if expected.is_none() {
                    vac.insert(Self::entry(new, ttl));
                    won = true;
                }
            }
        }
        Ok(won)
    }

    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, KvError> {
        let result = match self.map.entry(key.to_string()) {
            dashmap::Entry::Occupied(mut occ) if occ.get().live() => {
                let current: i64 = occ.get().value.parse().unwrap_or(0);
                let next = current + by;
                let expires_at = occ.get().expires_at;
                occ.insert(Entry {
                    value: next.to_string(),
                    expires_at,
                });
                next
            }
            dashmap::Entry::Occupied(mut occ) => {
                occ.insert(Self::entry(&by.to_string(), ttl));
                by
            }
            dashmap::Entry::Vacant(vac) => {
                vac.insert(Self::entry(&by.to_string(), ttl));
                by
            }
        };
        Ok(result)
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
