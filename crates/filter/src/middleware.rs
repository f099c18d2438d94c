use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use ipnet::IpNet;
use tower::{Layer, Service};

use audit::AuditSink;
use cache::Kv;

use crate::blacklist::{Blacklist, SyncMode};
use crate::ip_queue::IpQueue;

pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Parses one configured whitelist entry as a CIDR range. A bare address
/// (no `/prefix`) expands to a host route, matching a single-address entry
/// meant to whitelist exactly that ip.
pub fn parse_whitelist_entry(entry: &str) -> Option<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net);
    }
    entry.parse::<std::net::IpAddr>().ok().map(IpNet::from)
}

pub struct IpFilterConfig {
    pub queue_size: usize,
    pub br_queue_size: usize,
    pub treshold: u64,
    pub br_treshold: u64,
    pub blacklist_ttl: Option<Duration>,
    pub br_blacklist_ttl: Option<Duration>,
    pub ip_queue_ttl: Duration,
    pub ip_whitelist: Vec<IpNet>,
    pub observe: bool,
    pub sync_mode: SyncMode,
    pub callback: Option<Callback>,
    pub br_callback: Option<Callback>,
}

/// Composes the two [`IpQueue`]s and the [`Blacklist`] into the abuse-
/// resistance decision described for the filter: reject, count, blacklist,
/// observe.
pub struct IpFilter<K> {
    config: IpFilterConfig,
    queue: IpQueue,
    br_queue: IpQueue,
    blacklist: Blacklist<K>,
    request_counter: AtomicU32,
    audit: Arc<dyn AuditSink>,
}

impl<K: Kv> IpFilter<K> {
    pub fn new(kv: K, config: IpFilterConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            queue: IpQueue::new(config.queue_size, config.ip_queue_ttl),
            br_queue: IpQueue::new(config.br_queue_size, config.ip_queue_ttl),
            blacklist: Blacklist::new(kv),
            request_counter: AtomicU32::new(0),
            audit,
            config,
        }
    }

    fn is_whitelisted(&self, ip: &std::net::IpAddr) -> bool {
        self.config.ip_whitelist.iter().any(|net| net.contains(ip))
    }

    /// Runs the synchronous-mode reconciliation tick if configured and due.
    /// Best-effort: errors are logged and swallowed.
    fn maybe_sync_tick(&self) {
        if let SyncMode::Sync { update_every } = self.config.sync_mode {
            let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
            if update_every > 0 && n % update_every == 0 {
                if let Err(err) = self.blacklist.tick() {
                    log::error!("blacklist reconciliation tick failed: {err:#}");
                }
            }
        }
    }

    /// Step 3 of the request dispatch: admit, count, maybe blacklist.
    fn check_ip(&self, ip: &str, ip_addr: &std::net::IpAddr) {
        if self.is_whitelisted(ip_addr) {
            return;
        }
        if self.config.observe && self.blacklist.contains(ip) {
            return;
        }
        self.queue.touch(ip);
        if self.queue.count(ip) >= self.config.treshold {
            self.blacklist.add(ip, self.config.blacklist_ttl);
            self.audit.blacklisted(ip);
            if let Some(cb) = &self.config.callback {
                cb(ip);
            }
        }
    }

    /// Step 4's bad-request half: fired once a response's status starts
    /// with `400`.
    fn inc_bad_request(&self, ip: &str, ip_addr: &std::net::IpAddr) {
        self.audit.bad_request(ip);
        if let Some(cb) = &self.config.br_callback {
            cb(ip);
        }
        if self.is_whitelisted(ip_addr) {
            return;
        }
        if self.config.observe && self.blacklist.contains(ip) {
            return;
        }
        self.br_queue.touch(ip);
        if self.br_queue.count(ip) >= self.config.br_treshold {
            self.blacklist.add(ip, self.config.br_blacklist_ttl);
            self.audit.blacklisted(ip);
            if let Some(cb) = &self.config.callback {
                cb(ip);
            }
        }
    }

    /// Lists currently blacklisted ips, for the admin view.
    pub fn blacklisted(&self) -> Vec<String> {
        self.blacklist.list()
    }

    pub fn sync_mode(&self) -> &SyncMode {
        &self.config.sync_mode
    }

    /// Runs one blacklist reconciliation tick; used by the standalone
    /// reconciler task under [`SyncMode::Async`].
    pub fn run_reconciler_tick(&self) -> anyhow::Result<()> {
        self.blacklist.tick()
    }

    /// Removes `ips` from the blacklist and both queues, then persists.
    pub fn admin_remove(&self, ips: &[String]) -> anyhow::Result<()> {
        for ip in ips {
            self.blacklist.remove(ip);
            self.queue.remove(ip);
            self.br_queue.remove(ip);
        }
        self.blacklist.save()
    }
}

fn client_ip<B>(req: &Request<B>) -> Option<(String, std::net::IpAddr)> {
    if let Some(value) = req.headers().get("x-forwarded-for") {
        if let Ok(s) = value.to_str() {
            let first = s.split(',').next().unwrap_or("").trim();
            if let Ok(addr) = first.parse::<std::net::IpAddr>() {
                return Some((first.to_string(), addr));
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|ConnectInfo(addr)| (addr.ip().to_string(), addr.ip()))
}

#[derive(Clone)]
pub struct IpFilterLayer<K> {
    filter: Arc<IpFilter<K>>,
}

impl<K> IpFilterLayer<K> {
    pub fn new(filter: Arc<IpFilter<K>>) -> Self {
        Self { filter }
    }
}

impl<S, K> Layer<S> for IpFilterLayer<K> {
    type Service = IpFilterService<S, K>;

    fn layer(&self, inner: S) -> Self::Service {
        IpFilterService {
            inner,
            filter: self.filter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct IpFilterService<S, K> {
    inner: S,
    filter: Arc<IpFilter<K>>,
}

impl<S, K, ReqBody, RespBody> Service<Request<ReqBody>> for IpFilterService<S, K>
where
    S: Service<Request<ReqBody>, Response = Response<RespBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    RespBody: Default + Send + 'static,
    K: Kv + 'static,
{
    type Response = Response<RespBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let filter = self.filter.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let ip = client_ip(&req);

        Box::pin(async move {
            let Some((ip, ip_addr)) = ip else {
                return Ok(forbidden());
            };

            if filter.blacklist.contains(&ip) && !filter.config.observe {
                return Ok(forbidden());
            }

            filter.maybe_sync_tick();
            filter.check_ip(&ip, &ip_addr);

            let response = inner.call(req).await?;

            if response.status().as_str().starts_with("400") {
                filter.inc_bad_request(&ip, &ip_addr);
            }

            Ok(response)
        })
    }
}

fn forbidden<RespBody: Default>() -> Response<RespBody> {
    let mut response = Response::new(RespBody::default());
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::MemoryKv;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAuditSink {
        events: Mutex<Vec<String>>,
    }

    impl AuditSink for RecordingAuditSink {
        fn blacklisted(&self, ip: &str) {
            self.events.lock().unwrap().push(format!("blacklisted {ip}"));
        }

        fn bad_request(&self, ip: &str) {
            self.events.lock().unwrap().push(format!("bad_request {ip}"));
        }
    }

    fn config(whitelist: Vec<IpNet>) -> IpFilterConfig {
        IpFilterConfig {
            queue_size: 16,
            br_queue_size: 16,
            treshold: 3,
            br_treshold: 3,
            blacklist_ttl: Some(Duration::from_secs(60)),
            br_blacklist_ttl: Some(Duration::from_secs(60)),
            ip_queue_ttl: Duration::from_secs(60),
            ip_whitelist: whitelist,
            observe: false,
            sync_mode: SyncMode::Sync { update_every: 0 },
            callback: None,
            br_callback: None,
        }
    }

    #[test]
    fn crosses_treshold_after_enough_touches() {
        let filter = IpFilter::new(MemoryKv::new(), config(vec![]), Arc::new(audit::LoggingAuditSink));
        let addr: std::net::IpAddr = "9.9.9.9".parse().unwrap();
        for _ in 0..3 {
            filter.check_ip("9.9.9.9", &addr);
        }
        assert!(filter.blacklist.contains("9.9.9.9"));
    }

    #[test]
    fn whitelisted_ip_never_counted_or_blacklisted() {
        let net: IpNet = "9.9.9.9/32".parse().unwrap();
        let filter = IpFilter::new(MemoryKv::new(), config(vec![net]), Arc::new(audit::LoggingAuditSink));
        let addr: std::net::IpAddr = "9.9.9.9".parse().unwrap();
        for _ in 0..10 {
            filter.check_ip("9.9.9.9", &addr);
        }
        assert!(!filter.blacklist.contains("9.9.9.9"));
        assert!(!filter.queue.contains("9.9.9.9"));
    }

    #[test]
    fn observe_mode_skips_counters_once_blacklisted() {
        let mut cfg = config(vec![]);
        cfg.observe = true;
        let filter = IpFilter::new(MemoryKv::new(), cfg, Arc::new(audit::LoggingAuditSink));
        filter.blacklist.add("9.9.9.9", Some(Duration::from_secs(60)));
        let addr: std::net::IpAddr = "9.9.9.9".parse().unwrap();
        filter.check_ip("9.9.9.9", &addr);
        assert!(!filter.queue.contains("9.9.9.9"));
    }

    #[test]
    fn admin_remove_clears_blacklist_and_queues() {
        let filter = IpFilter::new(MemoryKv::new(), config(vec![]), Arc::new(audit::LoggingAuditSink));
        let addr: std::net::IpAddr = "9.9.9.9".parse().unwrap();
        for _ in 0..3 {
            filter.check_ip("9.9.9.9", &addr);
        }
        assert!(filter.blacklisted().contains(&"9.9.9.9".to_string()));
        filter.admin_remove(&["9.9.9.9".to_string()]).unwrap();
        assert!(!filter.blacklisted().contains(&"9.9.9.9".to_string()));
    }

    #[test]
    fn blacklist_transition_and_bad_request_are_audited() {
        let sink = Arc::new(RecordingAuditSink::default());
        let filter = IpFilter::new(MemoryKv::new(), config(vec![]), sink.clone());
        let addr: std::net::IpAddr = "9.9.9.9".parse().unwrap();

        for _ in 0..3 {
            filter.check_ip("9.9.9.9", &addr);
        }
        filter.inc_bad_request("9.9.9.9", &addr);

        let events = sink.events.lock().unwrap();
        assert!(events.iter().any(|e| e == "blacklisted 9.9.9.9"));
        assert!(events.iter().any(|e| e == "bad_request 9.9.9.9"));
    }
}
