// src/tasks.rs
//
// Long-lived background loops. Each takes the shared shutdown receiver and
// exits promptly when it flips.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{INTEREST_STALE_TTL, STALE_PRUNE_INTERVAL};
use crate::interests::InterestService;
use crate::manager::SubscriptionManager;

/// Every 5 minutes: prune interests whose heartbeat went silent for over an
/// hour, then release upstream subscriptions that lost their last interest.
pub fn spawn_stale_pruner(
    interests: Arc<InterestService>,
    manager: Arc<SubscriptionManager>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STALE_PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("stale pruner stopping");
                    return;
                }
            }
            let cutoff = Utc::now()
                - chrono::Duration::from_std(INTEREST_STALE_TTL).expect("ttl fits");
            let removed = match interests.prune_stale(cutoff).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!("Stale prune cycle failed: {e}");
                    continue;
                }
            };
            if removed.is_empty() {
                continue;
            }
            info!("Pruned {} stale interest(s)", removed.len());
            for (key, still_used) in removed {
                if still_used {
                    continue;
                }
                if let Err(e) = manager.release(&key).await {
                    warn!(key = %key, "Failed releasing pruned key: {e}");
                }
            }
        }
    })
}
