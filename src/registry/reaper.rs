// Background liveness reaper
//
// Wakes on a fixed interval, deletes agents whose heartbeat fell outside the
// TTL (capabilities cascade with them), then sweeps any capability rows left
// without an agent. Errors are logged and the loop keeps running; the loop
// ends only on the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::cache::TtlCache;
use super::store::RegistryStore;
use crate::config::RegistryConfig;

pub async fn run_reaper(
    store: RegistryStore,
    agent_cache: Arc<TtlCache<serde_json::Value>>,
    config: RegistryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.agent_cleanup_interval_seconds.max(1));
    let ttl = config.agent_ttl_seconds;

    tracing::info!(
        "starting agent cleanup task (interval: {}s, TTL: {}s)",
        interval.as_secs(),
        ttl
    );

    loop {
        if *shutdown.borrow() {
            tracing::info!("agent cleanup task stopped");
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                tracing::info!("agent cleanup task stopped");
                return;
            }
        }

        let tick_store = store.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let reaped = tick_store.delete_expired_agents(ttl)?;
            let orphans = tick_store.delete_orphan_capabilities()?;
            anyhow::Ok((reaped, orphans))
        })
        .await;

        match outcome {
            Ok(Ok((0, 0))) => tracing::debug!("no expired agents to clean up"),
            Ok(Ok((reaped, orphans))) => {
                tracing::info!(
                    "cleaned up {} expired agent(s), {} orphaned capability row(s)",
                    reaped,
                    orphans
                );
                // Reaped rows may still sit in cached query results.
                agent_cache.clear();
            }
            Ok(Err(e)) => tracing::error!("agent cleanup failed: {:#}", e),
            Err(e) => tracing::error!("agent cleanup task panicked: {}", e),
        }
    }
}
