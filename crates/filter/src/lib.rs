pub mod blacklist;
pub mod ip_queue;
pub mod middleware;

pub use blacklist::{Blacklist, SyncMode};
pub use ip_queue::IpQueue;
pub use middleware::{
    Callback, IpFilter, IpFilterConfig, IpFilterLayer, IpFilterService, parse_whitelist_entry,
};

use std::sync::Arc;

use cache::Kv;
use tokio::sync::watch;

/// Handle to a spawned reconciler task. Dropping it without calling
/// [`ReconcilerHandle::shutdown`] leaves the task running detached; callers
/// that want a clean exit should hold onto it and shut it down explicitly.
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Flips the shutdown flag and waits for the task to observe it and
    /// return.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawns the asynchronous reconciler task for a filter whose [`SyncMode`]
/// is [`SyncMode::Async`]. No-op (returns `None`) under [`SyncMode::Sync`],
/// since that mode reconciles inline on the request path instead.
///
/// The task never exits on tick error: a failed tick is logged and the loop
/// continues, since a dying reconciler is a correctness hazard, not just
/// an inconvenience. It does exit, cleanly, once [`ReconcilerHandle::shutdown`]
/// is called.
pub fn spawn_reconciler<K: Kv + 'static>(filter: Arc<IpFilter<K>>) -> Option<ReconcilerHandle> {
    let frequency = match filter.sync_mode() {
        SyncMode::Async { frequency } => *frequency,
        SyncMode::Sync { .. } => return None,
    };

    let (tx_shutdown, mut rx_shutdown) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(frequency);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = filter.run_reconciler_tick() {
                        log::error!("blacklist reconciler tick failed: {err:#}");
                    }
                }
                _ = rx_shutdown.changed() => {
                    if *rx_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    Some(ReconcilerHandle {
        shutdown: tx_shutdown,
        task,
    })
}
