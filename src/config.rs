use std::{fs::read_to_string, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

use filter::SyncMode;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// rendezvous server listen address
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
}

impl Server {
    fn listen() -> SocketAddr {
        "127.0.0.1:8000".parse().unwrap()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Channel {
    ///
    /// length in characters of a generated channel id
    ///
    #[serde(default = "Channel::cid_len")]
    pub cid_len: usize,
    ///
    /// channel lifetime, in seconds
    ///
    #[serde(default = "Channel::ttl")]
    pub ttl: u64,
    ///
    /// number of successful GETs a channel survives before it is destroyed
    ///
    #[serde(default = "Channel::max_gets")]
    pub max_gets: u64,
    ///
    /// URL the health-checked `/` redirects to on success
    ///
    #[serde(default = "Channel::root_redirect")]
    pub root_redirect: String,
    ///
    /// fixed prefix every channel-service key is namespaced under in the
    /// shared cache
    ///
    #[serde(default = "Channel::kv_prefix")]
    pub kv_prefix: String,
    ///
    /// use the single-process in-memory cache fallback instead of a
    /// remote cache backend
    ///
    #[serde(default)]
    pub use_memory: bool,
}

impl Channel {
    fn cid_len() -> usize {
        4
    }

    fn ttl() -> u64 {
        300
    }

    fn max_gets() -> u64 {
        6
    }

    fn root_redirect() -> String {
        "https://www.mozilla.org/".to_string()
    }

    fn kv_prefix() -> String {
        "keyexchange:".to_string()
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            cid_len: Self::cid_len(),
            ttl: Self::ttl(),
            max_gets: Self::max_gets(),
            root_redirect: Self::root_redirect(),
            kv_prefix: Self::kv_prefix(),
            use_memory: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Filter {
    #[serde(default = "Filter::queue_size")]
    pub queue_size: usize,
    #[serde(default = "Filter::br_queue_size")]
    pub br_queue_size: usize,
    #[serde(default = "Filter::treshold")]
    pub treshold: u64,
    #[serde(default = "Filter::br_treshold")]
    pub br_treshold: u64,
    #[serde(default)]
    pub blacklist_ttl: Option<u64>,
    #[serde(default)]
    pub br_blacklist_ttl: Option<u64>,
    #[serde(default = "Filter::ip_queue_ttl")]
    pub ip_queue_ttl: u64,
    ///
    /// CIDR ranges or single addresses that are never counted or
    /// blacklisted
    ///
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    ///
    /// dry-run: abuse signals are still recorded but no request is denied
    ///
    #[serde(default)]
    pub observe: bool,
    ///
    /// background reconciler tick, in seconds. Mutually exclusive with
    /// `update-blfreq`; this is used when neither or only this is set.
    ///
    #[serde(default)]
    pub refresh_frequency: Option<u64>,
    ///
    /// reconcile the blacklist inline every this many requests instead of
    /// on a background task. Mutually exclusive with `refresh-frequency`.
    ///
    #[serde(default)]
    pub update_blfreq: Option<u32>,
    ///
    /// path the blacklist admin page is served on. Unset disables it.
    ///
    #[serde(default)]
    pub admin_page: Option<String>,
}

impl Filter {
    fn queue_size() -> usize {
        1000
    }

    fn br_queue_size() -> usize {
        1000
    }

    fn treshold() -> u64 {
        20
    }

    fn br_treshold() -> u64 {
        10
    }

    fn ip_queue_ttl() -> u64 {
        60
    }

    /// Resolves the two mutually exclusive reconciliation knobs into a
    /// single [`SyncMode`]. `update-blfreq` wins if both are set; absent
    /// either, falls back to an asynchronous tick every 60 seconds.
    pub fn sync_mode(&self) -> SyncMode {
        if let Some(update_every) = self.update_blfreq {
            SyncMode::Sync { update_every }
        } else {
            let frequency = self.refresh_frequency.unwrap_or(60);
            SyncMode::Async {
                frequency: Duration::from_secs(frequency),
            }
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            queue_size: Self::queue_size(),
            br_queue_size: Self::br_queue_size(),
            treshold: Self::treshold(),
            br_treshold: Self::br_treshold(),
            blacklist_ttl: None,
            br_blacklist_ttl: None,
            ip_queue_ttl: Self::ip_queue_ttl(),
            ip_whitelist: Vec::new(),
            observe: false,
            refresh_frequency: None,
            update_blfreq: None,
            admin_page: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: keyexchange-server --config /etc/keyexchange/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(
            &Cli::parse().config,
        )?)?)
    }
}
