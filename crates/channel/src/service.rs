use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use audit::AuditSink;
use cache::Kv;

use crate::error::ChannelError;
use crate::model::{Channel, generate_cid, md5_hex, valid_client_id};

pub struct ChannelConfig {
    pub cid_len: usize,
    pub ttl: Duration,
    pub max_gets: u64,
    pub root_redirect: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            cid_len: 4,
            ttl: Duration::from_secs(300),
            max_gets: 6,
            root_redirect: "https://mozilla.org".to_string(),
        }
    }
}

pub enum GetOutcome {
    NotModified,
    Ok { payload: Vec<u8>, etag: String },
}

pub struct ReportOutcome {
    pub log_message: Option<String>,
    pub deleted: bool,
}

/// The rendezvous state machine: creation, two-party admission, conditional
/// PUT/GET, report-and-delete, GET-count cap, TTL.
pub struct ChannelService<K> {
    kv: K,
    config: ChannelConfig,
    audit: Arc<dyn AuditSink>,
}

impl<K: Kv> ChannelService<K> {
    pub fn new(kv: K, config: ChannelConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self { kv, config, audit }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Generates candidate ids until one can be claimed, up to 100
    /// attempts. Each attempt is a single `add`, which only succeeds if
    /// the candidate is currently absent — so a collision simply costs an
    /// attempt, it is never a correctness hazard.
    pub fn new_channel(&self, client_id: &str) -> Result<String, ChannelError> {
        if !valid_client_id(client_id) {
            return Err(ChannelError::BadClientId);
        }

        let ttl_epoch = now() + self.config.ttl.as_secs();
        for _ in 0..100 {
            let cid = generate_cid(self.config.cid_len);
            let channel = Channel::new(ttl_epoch, client_id);
            let encoded = channel.encode()?;
            if self.kv.add(&cid, encoded, self.config.ttl)? {
                return Ok(cid);
            }
        }

        Err(ChannelError::Unavailable(anyhow::anyhow!(
            "exhausted 100 channel id candidates"
        )))
    }

    /// Validates the client id, loads the channel, and registers the
    /// client id into its `ids` per the admission rules. On any failure
    /// the offending channel has already been destroyed before the error
    /// is returned.
    fn admit(&self, cid: &str, client_id: &str) -> Result<Channel, ChannelError> {
        if !valid_client_id(client_id) {
            if !self.delete_channel(cid) {
                self.audit.channel_deletion_failed(cid);
            }
            return Err(ChannelError::BadClientId);
        }

        let mut channel = self.load(cid)?.ok_or(ChannelError::NotFound)?;

        if channel.ids.len() < 2 {
            if !channel.ids.iter().any(|id| id == client_id) {
                channel.ids.push(client_id.to_string());
            }
        } else if !channel.ids.iter().any(|id| id == client_id) {
            if !self.delete_channel(cid) {
                self.audit.channel_deletion_failed(cid);
            }
            return Err(ChannelError::UnknownThirdParty);
        }

        self.store(cid, &channel)?;
        Ok(channel)
    }

    pub fn put(
        &self,
        cid: &str,
        client_id: &str,
        body: Vec<u8>,
        if_match: Option<&str>,
        if_none_match: Option<&str>,
    ) -> Result<String, ChannelError> {
        let mut channel = self.admit(cid, client_id)?;

        if if_match.is_some() && if_match != Some("*") {
            let etags = parse_etag_list(if_match.unwrap());
            let matches = channel
                .etag
                .as_deref()
                .map(|current| etags.iter().any(|e| e == current))
                .unwrap_or(false);
            if !matches {
                return Err(ChannelError::PreconditionFailed {
                    etag: channel.etag.clone(),
                });
            }
        } else if if_none_match == Some("*") && !channel.is_sentinel() {
            return Err(ChannelError::PreconditionFailed {
                etag: channel.etag.clone(),
            });
        }

        let etag = md5_hex(&body);
        channel.payload = body;
        channel.etag = Some(etag.clone());
        self.store(cid, &channel)?;
        Ok(etag)
    }

    pub fn get(
        &self,
        cid: &str,
        client_id: &str,
        if_none_match: Option<&str>,
    ) -> Result<GetOutcome, ChannelError> {
        let channel = self.admit(cid, client_id)?;

        if let Some(inm) = if_none_match {
            if channel.etag.as_deref() == Some(inm) {
                return Ok(GetOutcome::NotModified);
            }
        }

        let counter_key = format!("GET:{cid}");
        let ttl = ttl_duration(channel.ttl_epoch);
        let mut should_delete = false;

        match self.kv.get(&counter_key)? {
            None => {
                self.kv.set(&counter_key, b"1".to_vec(), ttl)?;
                if 1 == self.config.max_gets {
                    should_delete = true;
                }
            }
            Some(raw) => {
                let current: u64 = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                if current + 1 == self.config.max_gets {
                    should_delete = true;
                } else {
                    self.kv.incr(&counter_key)?;
                }
            }
        }

        let payload = channel.payload.clone();
        let etag = channel.etag.clone().unwrap_or_default();

        if should_delete && !self.delete_channel(cid) {
            self.audit.channel_deletion_failed(cid);
        }

        Ok(GetOutcome::Ok { payload, etag })
    }

    /// Appends the log header and up to 2000 bytes of body to an audit
    /// message (only if at least one is non-empty), and deletes the named
    /// channel iff both a client id and a channel id were given and that
    /// channel exists. Always best-effort: this never fails the caller.
    pub fn report(
        &self,
        log_header: Option<&str>,
        body: &[u8],
        client_id: Option<&str>,
        cid: Option<&str>,
    ) -> ReportOutcome {
        let truncated = &body[..body.len().min(2000)];

        let mut parts = Vec::new();
        if let Some(header) = log_header {
            if !header.is_empty() {
                parts.push(header.to_string());
            }
        }
        if !truncated.is_empty() {
            parts.push(String::from_utf8_lossy(truncated).into_owned());
        }
        let log_message = if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        };

        let mut deleted = false;
        if let (Some(_), Some(cid)) = (client_id, cid) {
            if matches!(self.load(cid), Ok(Some(_))) {
                deleted = self.delete_channel(cid);
            }
        }

        ReportOutcome {
            log_message,
            deleted,
        }
    }

    /// Adds a random key, reads it back, deletes it, and verifies absence.
    /// Any step failing or disagreeing means the backend is unhealthy.
    pub fn health_check(&self) -> Result<(), ChannelError> {
        let key = format!("health:{}", generate_cid(8));

        self.kv.add(&key, b"test".to_vec(), Duration::from_secs(5))?;

        let value = self.kv.get(&key)?;
        if value.as_deref() != Some(&b"test"[..]) {
            return Err(ChannelError::Unavailable(anyhow::anyhow!(
                "health check readback did not match"
            )));
        }

        self.kv.delete(&key)?;
        if self.kv.get(&key)?.is_some() {
            return Err(ChannelError::Unavailable(anyhow::anyhow!(
                "health check key was not deleted"
            )));
        }

        Ok(())
    }

    fn load(&self, cid: &str) -> Result<Option<Channel>, ChannelError> {
        match self.kv.get(cid)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(Channel::decode(&bytes)?)),
        }
    }

    fn store(&self, cid: &str, channel: &Channel) -> Result<(), ChannelError> {
        let ttl = ttl_duration(channel.ttl_epoch);
        let encoded = channel.encode()?;
        self.kv.set(cid, encoded, ttl)?;
        Ok(())
    }

    /// Deletes a channel and its GET counter. Best-effort: failures are
    /// swallowed, the caller only gets a success/failure signal to decide
    /// whether to emit an audit event.
    fn delete_channel(&self, cid: &str) -> bool {
        let counter_key = format!("GET:{cid}");
        let _ = self.kv.delete(&counter_key);
        self.kv.delete(cid).unwrap_or(false)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn ttl_duration(ttl_epoch: u64) -> Duration {
    Duration::from_secs(ttl_epoch.saturating_sub(now()))
}

fn parse_etag_list(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .collect()
}
