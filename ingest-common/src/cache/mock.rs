use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CacheError, Client};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRedisCall {
    Exists(String),
    SetEx(String, u64),
}

/// In-memory cache keeping set keys, with optional injected failures.
/// Clones share state, so a test can keep a handle on what the code under test wrote.
/// TTLs are recorded but never expire.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    keys: Arc<Mutex<HashMap<String, u64>>>,
    exists_error: Arc<Mutex<Option<CacheError>>>,
    set_ex_error: Arc<Mutex<Option<CacheError>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cache call fails, as if redis was unreachable.
    pub fn unreachable() -> Self {
        Self::new()
            .exists_error(Some(CacheError::Timeout))
            .set_ex_error(Some(CacheError::Timeout))
    }

    pub fn exists_error(self, err: Option<CacheError>) -> Self {
        *lock(&self.exists_error) = err;
        self
    }

    pub fn set_ex_error(self, err: Option<CacheError>) -> Self {
        *lock(&self.set_ex_error) = err;
        self
    }

    pub fn insert(&self, key: &str, ttl: u64) {
        lock(&self.keys).insert(key.to_owned(), ttl);
    }

    /// Drop every key, like an eviction or a cache restart.
    pub fn clear(&self) {
        lock(&self.keys).clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.keys).contains_key(key)
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        lock(&self.keys).get(key).copied()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn exists(&self, k: String) -> Result<bool, CacheError> {
        lock(&self.calls).push(MockRedisCall::Exists(k.clone()));
        if let Some(err) = lock(&self.exists_error).clone() {
            return Err(err);
        }
        Ok(self.contains(&k))
    }

    async fn set_ex(&self, k: String, seconds: u64) -> Result<(), CacheError> {
        lock(&self.calls).push(MockRedisCall::SetEx(k.clone(), seconds));
        if let Some(err) = lock(&self.set_ex_error).clone() {
            return Err(err);
        }
        self.insert(&k, seconds);
        Ok(())
    }
}
