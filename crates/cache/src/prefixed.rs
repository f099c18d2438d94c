use std::time::Duration;

use anyhow::Result;

use crate::Kv;

/// Namespaces every key under a fixed prefix before delegating to an inner
/// [`Kv`].
///
/// The source this was distilled from (`PrefixedCache`) took a `prefix`
/// constructor argument and then discarded it, assigning `self.prefix = ''`
/// unconditionally — so every instance silently shared one flat namespace.
/// This implementation honors the prefix it is given.
pub struct PrefixedKv<K> {
    inner: K,
    prefix: String,
}

impl<K: Kv> PrefixedKv<K> {
    pub fn new(inner: K, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl<K: Kv> Kv for PrefixedKv<K> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(&self.key(key))
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.inner.set(&self.key(key), value, ttl)
    }

    fn add(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.inner.add(&self.key(key), value, ttl)
    }

    fn replace(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.inner.replace(&self.key(key), value, ttl)
    }

    fn cas(&self, key: &str, value: Vec<u8>, ttl: Duration, token: u64) -> Result<bool> {
        self.inner.cas(&self.key(key), value, ttl, token)
    }

    fn incr(&self, key: &str) -> Result<u64> {
        self.inner.incr(&self.key(key))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(&self.key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn different_prefixes_do_not_collide() {
        let backend = Arc::new(MemoryKv::new());
        let a = PrefixedKv::new(backend.clone(), "a:");
        let b = PrefixedKv::new(backend.clone(), "b:");

        a.set("k", b"from-a".to_vec(), Duration::from_secs(1)).unwrap();
        b.set("k", b"from-b".to_vec(), Duration::from_secs(1)).unwrap();

        assert_eq!(a.get("k").unwrap(), Some(b"from-a".to_vec()));
        assert_eq!(b.get("k").unwrap(), Some(b"from-b".to_vec()));
        assert_eq!(backend.get("a:k").unwrap(), Some(b"from-a".to_vec()));
        assert_eq!(backend.get("b:k").unwrap(), Some(b"from-b".to_vec()));
    }

    #[test]
    fn same_prefix_shares_namespace() {
        let backend = Arc::new(MemoryKv::new());
        let a = PrefixedKv::new(backend.clone(), "x:");
        let a2 = PrefixedKv::new(backend, "x:");

        a.set("k", b"v".to_vec(), Duration::from_secs(1)).unwrap();
        assert_eq!(a2.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
