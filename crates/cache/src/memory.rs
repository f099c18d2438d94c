use std::time::{Duration, Instant};

use ahash::HashMap;
use anyhow::Result;
use parking_lot::Mutex;

use crate::Kv;

struct Entry {
    value: Vec<u8>,
    /// Recorded but never swept: see [`Kv`]'s note on TTL being advisory
    /// only for this single-process fallback.
    #[allow(dead_code)]
    expires_at: Option<Instant>,
    version: u64,
}

/// Single-process fallback used when no remote cache is configured.
///
/// Does not honor `ttl` for eviction; entries live until `delete`d or the
/// process exits. This mirrors the source's `MemoryClient`, used the same
/// way: as a drop-in when `use_memory` is set, not as a production backend.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a key, for constructing a valid `cas` token in
    /// tests. Not part of the [`Kv`] contract.
    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.entries.lock().get(key).map(|e| e.version)
    }
}

impl Kv for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let version = entries.get(key).map(|e| e.version + 1).unwrap_or(0);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
                version,
            },
        );
        Ok(true)
    }

    fn add(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
                version: 0,
            },
        );
        Ok(true)
    }

    fn replace(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let Some(existing) = entries.get(key) else {
            return Ok(false);
        };
        let version = existing.version + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
                version,
            },
        );
        Ok(true)
    }

    fn cas(&self, key: &str, value: Vec<u8>, ttl: Duration, token: u64) -> Result<bool> {
        let mut entries = self.entries.lock();
        let Some(existing) = entries.get(key) else {
            return Ok(false);
        };
        if existing.version != token {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
                version: token + 1,
            },
        );
        Ok(true)
    }

    fn incr(&self, key: &str) -> Result<u64> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| anyhow::anyhow!("incr on missing key {key}"))?;
        let current: u64 = std::str::from_utf8(&entry.value)?
            .parse()
            .map_err(|_| anyhow::anyhow!("incr on non-numeric value for key {key}"))?;
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        entry.version += 1;
        Ok(next)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.entries.lock().remove(key);
        Ok(true)
    }
}
