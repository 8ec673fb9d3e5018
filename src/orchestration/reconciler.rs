use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::errors::StoreResult;
use crate::store::PageStore;
use crate::utils::Metrics;

/// Periodically releases processing claims whose lease ran out.
///
/// A job that dies without finalizing (process crash, lost runtime) leaves
/// its row in processing; once the lease passes, the sweep resets it so the
/// page can be requested again.
pub struct ClaimReconciler {
    store: Arc<dyn PageStore>,
    metrics: Metrics,
    interval: Duration,
}

impl ClaimReconciler {
    pub fn new(store: Arc<dyn PageStore>, metrics: Metrics, interval: Duration) -> Self {
        Self {
            store,
            metrics,
            interval,
        }
    }

    /// Run one sweep and return the number of released claims
    pub async fn sweep_once(&self) -> StoreResult<usize> {
        let released = self.store.release_expired_claims().await?;
        if released > 0 {
            self.metrics.record_stale_claims_released(released);
            warn!("Released {} expired processing claim(s)", released);
        } else {
            debug!("No expired claims");
        }
        Ok(released)
    }

    /// Spawn the sweep loop. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        info!("Starting claim reconciler (interval: {}s)", self.interval.as_secs());

        tokio::spawn(async move {
            let mut timer = interval(self.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                timer.tick().await;
                if let Err(e) = self.sweep_once().await {
                    error!("Claim reconciliation failed: {}", e);
                }
            }
        })
    }
}
