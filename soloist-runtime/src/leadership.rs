//! Leader-side lease refresh.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use soloist_core::{
    store::{LeaseStore, RefreshOutcome},
    Channel, Config, LeadershipId,
};
use tokio::{sync::watch, time::MissedTickBehavior};

use crate::{subscription::CloseReason, util};

/// Periodically extends the lease for one channel this node leads.
///
/// The failure budget is tuned so the task stands down strictly before the
/// lease can expire under it: a leader that cannot reach the store stops its
/// stream while followers still consider the lease valid, and the lease then
/// lapses on its own with no split-brain window.
pub(crate) struct RefreshTask {
    pub(crate) channel: Channel,
    pub(crate) leadership: LeadershipId,
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) config: Config,
    pub(crate) stop: Arc<watch::Sender<bool>>,
    pub(crate) lost: Arc<AtomicBool>,
    pub(crate) signal: Arc<watch::Sender<Option<CloseReason>>>,
}

impl RefreshTask {
    #[tracing::instrument(
        name = "refresh",
        skip(self),
        fields(channel = %self.channel, leadership = %self.leadership),
    )]
    pub(crate) async fn run(self) {
        let mut stop = self.stop.subscribe();
        let interval = self.config.refresh_interval();
        // The lease was just created; the first extension is due one full
        // interval from now.
        let mut ticks =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = util::until_stopping(&mut stop) => return,
                _ = ticks.tick() => {
                    match util::timed(
                        self.config.store_timeout(),
                        self.store.refresh(&self.channel, &self.leadership, self.config.lease_ttl()),
                    )
                    .await
                    {
                        Ok(RefreshOutcome::Refreshed) => {
                            failures = 0;
                            tracing::trace!("lease refreshed");
                        }
                        Ok(RefreshOutcome::NotFound) => {
                            tracing::warn!("lease vanished, standing down");
                            self.lose();
                            return;
                        }
                        Ok(RefreshOutcome::Mismatch) => {
                            tracing::warn!("lease taken over by another leadership, standing down");
                            self.lose();
                            return;
                        }
                        Err(err) => {
                            failures += 1;
                            tracing::warn!(
                                error = %err,
                                consecutive = failures,
                                budget = self.config.refresh_failure_budget(),
                                "lease refresh failed"
                            );
                            if failures >= self.config.refresh_failure_budget() {
                                tracing::warn!("refresh failure budget exhausted, standing down");
                                self.lose();
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Leadership is gone (or must be assumed gone). Stop the stream and tell
    /// leader-local subscriptions, but leave the lease alone: it either
    /// belongs to someone else already or will expire within one TTL.
    fn lose(&self) {
        self.lost.store(true, Ordering::Release);
        self.signal.send_replace(Some(CloseReason::LeadershipLost));
        self.stop.send_replace(true);
    }
}
