pub mod memory;
pub mod prefixed;

use std::time::Duration;

use anyhow::Result;

pub use memory::MemoryKv;
pub use prefixed::PrefixedKv;

/// Narrow contract over a shared key-value cache.
///
/// This is the only interface the rendezvous channel and the IP filter use
/// to reach shared state. A real deployment backs it with a memcached-like
/// remote server; [`MemoryKv`] is the single-process fallback used when no
/// such backend is configured.
///
/// `ttl` is advisory: callers must not rely on the backend enforcing expiry
/// for correctness, only for eventually reclaiming space.
pub trait Kv: Send + Sync {
    /// Fetches a value, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes unconditionally.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Writes iff the key is currently absent.
    fn add(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Writes iff the key is currently present.
    fn replace(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Writes iff the key's current value matches `token` under the
    /// backend's compare-and-swap semantics.
    ///
    /// Reserved: the channel rendezvous path never calls this, it uses
    /// plain `set`. Kept on the trait and exercised in tests so the
    /// contract is not dead surface.
    fn cas(&self, key: &str, value: Vec<u8>, ttl: Duration, token: u64) -> Result<bool>;

    /// Arithmetic increment on a decimal-ASCII value.
    ///
    /// Behavior on an absent or non-numeric value is backend-dependent;
    /// callers that need a defined starting value should `set` it first
    /// rather than relying on `incr` to create it.
    fn incr(&self, key: &str) -> Result<u64>;

    /// Deletes a key. Idempotent: returns `Ok(true)` even if the key was
    /// already absent.
    fn delete(&self, key: &str) -> Result<bool>;
}

impl<T: Kv + ?Sized> Kv for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        (**self).set(key, value, ttl)
    }

    fn add(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        (**self).add(key, value, ttl)
    }

    fn replace(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        (**self).replace(key, value, ttl)
    }

    fn cas(&self, key: &str, value: Vec<u8>, ttl: Duration, token: u64) -> Result<bool> {
        (**self).cas(key, value, ttl, token)
    }

    fn incr(&self, key: &str) -> Result<u64> {
        (**self).incr(key)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key)
    }
}
