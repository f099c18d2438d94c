use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};

use cache::Kv;

const BLACKLIST_KEY: &str = "blacklist";

/// On-wire shape for the shared blacklist: a set of ips plus a parallel map
/// of per-ip absolute expiry. Kept as two parts (rather than one list of
/// records) because that is the shape every instance reading this key
/// must agree on; changing it is a wire-compatibility break.
#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    ips: Vec<String>,
    ttls: HashMap<String, Option<u64>>,
}

struct Inner {
    ips: HashSet<String>,
    ttls: HashMap<String, Option<SystemTime>>,
    dirty: bool,
}

/// Two mutually exclusive ways the in-process blacklist reconciles with
/// the shared KV.
#[derive(Clone, Copy)]
pub enum SyncMode {
    /// A dedicated background task ticks every `frequency`.
    Async { frequency: Duration },
    /// The filter itself ticks every `update_every` requests it handles.
    Sync { update_every: u32 },
}

/// TTL'd, KV-reconciled set of blacklisted ips.
///
/// Reconciliation is read-modify-write without a true compare-and-swap: a
/// concurrent add on another instance can be lost between this instance's
/// `update` and its `save`. The next tick heals it, since `update` only
/// ever unions entries in, never removes what's locally present.
pub struct Blacklist<K> {
    kv: K,
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl<K: Kv> Blacklist<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            inner: ReentrantMutex::new(RefCell::new(Inner {
                ips: HashSet::new(),
                ttls: HashMap::new(),
                dirty: false,
            })),
        }
    }

    pub fn add(&self, ip: &str, ttl: Option<Duration>) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.ips.insert(ip.to_string());
        inner
            .ttls
            .insert(ip.to_string(), ttl.map(|d| SystemTime::now() + d));
        inner.dirty = true;
    }

    pub fn remove(&self, ip: &str) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.ips.remove(ip);
        inner.ttls.remove(ip);
        inner.dirty = true;
    }

    /// Lazy-expiry membership test: an entry past its expiry is erased and
    /// reported absent. No background sweep.
    pub fn contains(&self, ip: &str) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if !inner.ips.contains(ip) {
            return false;
        }
        if let Some(Some(expires_at)) = inner.ttls.get(ip).copied() {
            if expires_at <= SystemTime::now() {
                inner.ips.remove(ip);
                inner.ttls.remove(ip);
                return false;
            }
        }
        true
    }

    /// Lists all ips currently present, ignoring expiry (for the admin
    /// view; `contains` is still the authority for filter decisions).
    pub fn list(&self) -> Vec<String> {
        let guard = self.inner.lock();
        guard.borrow().ips.iter().cloned().collect()
    }

    /// Reads the shared snapshot and unions it into local state. Never
    /// removes a locally-present entry.
    pub fn update(&self) -> Result<()> {
        let raw = self.kv.get(BLACKLIST_KEY).context("reading blacklist key")?;
        let Some(raw) = raw else {
            return Ok(());
        };
        let snapshot: Snapshot =
            bincode::deserialize(&raw).context("decoding blacklist snapshot")?;

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.ips.extend(snapshot.ips);
        for (ip, expires_at) in snapshot.ttls {
            inner
                .ttls
                .entry(ip)
                .or_insert_with(|| expires_at.map(epoch_to_system_time));
        }
        Ok(())
    }

    /// If dirty, first `update`s (read-modify-write, no CAS — the
    /// acknowledged race), then writes the combined state back and clears
    /// dirty on success.
    pub fn save(&self) -> Result<()> {
        if !{
            let guard = self.inner.lock();
            guard.borrow().dirty
        } {
            return Ok(());
        }

        self.update()?;

        let snapshot = {
            let guard = self.inner.lock();
            let inner = guard.borrow();
            Snapshot {
                ips: inner.ips.iter().cloned().collect(),
                ttls: inner
                    .ttls
                    .iter()
                    .map(|(ip, expires_at)| (ip.clone(), expires_at.map(system_time_to_epoch)))
                    .collect(),
            }
        };

        let encoded = bincode::serialize(&snapshot).context("encoding blacklist snapshot")?;
        self.kv
            .set(BLACKLIST_KEY, encoded, Duration::from_secs(0))
            .context("writing blacklist key")?;

        let guard = self.inner.lock();
        guard.borrow_mut().dirty = false;
        Ok(())
    }

    /// Runs one reconciliation tick: `save` if dirty, else `update`.
    pub fn tick(&self) -> Result<()> {
        let dirty = {
            let guard = self.inner.lock();
            guard.borrow().dirty
        };
        if dirty { self.save() } else { self.update() }
    }
}

fn system_time_to_epoch(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn epoch_to_system_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}
