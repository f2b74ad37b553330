use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{metrics, rate_limit::LimiterStore};

/// Background eviction of idle client entries.
pub struct Sweeper;

pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Starts the sweep loop. A zero interval disables eviction and returns `None`.
    pub fn spawn(store: Arc<LimiterStore>, interval: Duration) -> Option<SweeperHandle> {
        if interval.is_zero() {
            tracing::warn!("Sweep interval is zero; idle rate limit entries will never be evicted");
            return None;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep_once(&store),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("sweeper stopped");
        });

        tracing::info!(interval_secs = interval.as_secs_f64(), "sweeper started");

        Some(SweeperHandle { shutdown, task })
    }
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            tracing::error!(error = %error, "sweeper task failed");
        }
    }
}

fn sweep_once(store: &LimiterStore) {
    let evicted = store.sweep(Instant::now().into_std());
    let tracked = store.len();
    metrics::record_sweep(evicted, tracked);

    if evicted > 0 {
        tracing::info!(evicted, tracked, "evicted idle rate limit entries");
    } else {
        tracing::debug!(tracked, "sweep found no idle rate limit entries");
    }
}
