pub mod admin;
pub mod api;
pub mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use audit::{AuditSink, LoggingAuditSink};
use cache::{MemoryKv, PrefixedKv};
use channel::{ChannelConfig, ChannelService};
use filter::{IpFilter, IpFilterConfig, parse_whitelist_entry, spawn_reconciler};
use tokio::net::TcpListener;

use crate::admin::PlainTextAdminView;
use crate::api::AppState;
use crate::config::Config;

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "keyexchange-server.",
    env!("CARGO_PKG_VERSION")
);

type SharedKv = Arc<PrefixedKv<Arc<MemoryKv>>>;

/// Opened so the integration tests can start the server directly from
/// this crate instead of shelling out to the binary.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let kv: SharedKv = Arc::new(PrefixedKv::new(
        Arc::new(MemoryKv::new()),
        config.channel.kv_prefix.clone(),
    ));

    let audit_sink: Arc<dyn AuditSink> = Arc::new(LoggingAuditSink);

    let channel = ChannelService::new(
        kv.clone(),
        ChannelConfig {
            cid_len: config.channel.cid_len,
            ttl: Duration::from_secs(config.channel.ttl),
            max_gets: config.channel.max_gets,
            root_redirect: config.channel.root_redirect.clone(),
        },
        audit_sink.clone(),
    );

    let ip_whitelist = config
        .filter
        .ip_whitelist
        .iter()
        .filter_map(|entry| {
            let parsed = parse_whitelist_entry(entry);
            if parsed.is_none() {
                log::warn!("ignoring unparseable whitelist entry: {entry}");
            }
            parsed
        })
        .collect();

    let filter = Arc::new(IpFilter::new(
        kv,
        IpFilterConfig {
            queue_size: config.filter.queue_size,
            br_queue_size: config.filter.br_queue_size,
            treshold: config.filter.treshold,
            br_treshold: config.filter.br_treshold,
            blacklist_ttl: config.filter.blacklist_ttl.map(Duration::from_secs),
            br_blacklist_ttl: config.filter.br_blacklist_ttl.map(Duration::from_secs),
            ip_queue_ttl: Duration::from_secs(config.filter.ip_queue_ttl),
            ip_whitelist,
            observe: config.filter.observe,
            sync_mode: config.filter.sync_mode(),
            callback: Some(Arc::new(|ip| log::warn!("callback: blacklisted ip={ip}"))),
            br_callback: Some(Arc::new(|ip| log::info!("br_callback: bad request ip={ip}"))),
        },
        audit_sink.clone(),
    ));

    let reconciler = spawn_reconciler(filter.clone());

    let state = Arc::new(AppState {
        channel,
        filter,
        audit: audit_sink,
        admin_view: Arc::new(PlainTextAdminView),
        admin_page: config.filter.admin_page.clone(),
    });

    let router = api::build_router(state);

    let listener = TcpListener::bind(config.server.listen).await?;
    log::info!("{SOFTWARE} listening on {}", config.server.listen);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(handle) = reconciler {
        handle.shutdown().await;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("failed to install ctrl-c handler: {err:#}");
    }
}
