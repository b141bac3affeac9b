//! Periodic cleanup of expired pending signups and idle rate-limit buckets.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::service::AccountService;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runs [`AccountService::purge_expired`] every `interval` until `shutdown`
/// turns true or its sender is dropped.
pub fn spawn_sweeper(
    accounts: AccountService,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = accounts.purge_expired().await {
                        warn!(error = %e, "pending verification sweep failed");
                    }
                }
                _ = async {
                    let _ = shutdown.wait_for(|stopping| *stopping).await;
                } => break,
            }
        }
        debug!("sweeper stopped");
    })
}
