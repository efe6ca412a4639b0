use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use nutcache_core::{JsonlRollupStore, Notification, Poller, ReadingCollector};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::output::print_notification;
use crate::OutputFormat;

const PRUNE_EVERY: Duration = Duration::from_secs(1800);

/// Polls until ctrl-c, printing every notification and keeping the rollup
/// directory pruned.
pub async fn run_daemon<C: ReadingCollector>(
    poller: &mut Poller<C>,
    store: Arc<JsonlRollupStore>,
    format: OutputFormat,
    retention_days: u64,
) -> Result<()> {
    let mut state = RunState::new(store, retention_days);
    let mut notifications = poller.manager().subscribe();

    let start = Instant::now() + Duration::from_millis(50);
    let mut ticker = interval_at(start, poller.interval());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Ok(outcome) = poller.tick().await {
                    let (ok, err) = poller.counters();
                    debug!(mode = ?outcome.mode, devices = outcome.devices, flush = ?outcome.report.flush, ok, err, "tick");
                }
                state.maybe_prune(SystemTime::now());
            }
            received = notifications.recv() => {
                match received {
                    Ok(notification) => {
                        print_notification(&notification, format)?;
                        if let Err(err) = state.write_latest(&notification) {
                            warn!(error = %err, "failed to write latest view");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "notification receiver lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

pub(crate) struct RunState {
    store: Arc<JsonlRollupStore>,
    retention_days: u64,
    last_prune: Option<SystemTime>,
}

impl RunState {
    pub(crate) fn new(store: Arc<JsonlRollupStore>, retention_days: u64) -> Self {
        Self {
            store,
            retention_days,
            last_prune: None,
        }
    }

    fn latest_path(&self) -> PathBuf {
        self.store.dir().join("latest.json")
    }

    /// Mirrors the last notification to `latest.json` next to the rollups.
    pub(crate) fn write_latest(&self, notification: &Notification) -> Result<()> {
        fs::write(self.latest_path(), serde_json::to_vec_pretty(notification)?)?;
        Ok(())
    }

    /// Prunes at most once per [`PRUNE_EVERY`]. Returns the number of files
    /// removed when a prune ran.
    pub(crate) fn maybe_prune(&mut self, now: SystemTime) -> Option<usize> {
        if let Some(last) = self.last_prune {
            if now.duration_since(last).unwrap_or_default() < PRUNE_EVERY {
                return None;
            }
        }
        self.last_prune = Some(now);

        match self.store.prune(self.retention_days, now) {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, retention_days = self.retention_days, "pruned old rollup files");
                }
                Some(removed)
            }
            Err(err) => {
                warn!(error = %err, "rollup prune failed");
                None
            }
        }
    }
}
