//! Per-client subscriptions and their delivery/watch task.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::Rng;
use soloist_core::{
    bus::PublicationStream,
    store::{LeaseStore, StoreUnavailable},
    survey::SurveyError,
    Channel, Config, Frame, LeadershipId, NodeId,
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::SendTimeoutError},
        oneshot, watch,
    },
    time::MissedTickBehavior,
};

use crate::{filter::DeliveryFilter, util};

/// Why a subscription failed to open.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The channel's leadership changed while the subscribe was in flight.
    /// The client retries; the retry runs a fresh election if needed.
    #[error("channel leadership changed during subscribe")]
    LeadershipChanged,
    /// The lease store stayed unavailable past the retry budget.
    #[error("lease store unavailable")]
    Store(#[from] StoreUnavailable),
    /// The survey to the channel's leader failed past the retry budget.
    #[error("survey to channel leader failed")]
    Survey(#[from] SurveyError),
    /// The node is shutting down and accepts no new subscriptions.
    #[error("node is shutting down")]
    ShuttingDown,
}

/// Items yielded by a [`Subscription`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// An upstream event that passed the delivery filter.
    Message(Bytes),
    /// Terminal: the subscription is dead and the client must resubscribe.
    /// No further items follow.
    Closed(CloseReason),
}

/// Terminal close reasons, distinguished so clients can choose between
/// resubscribing from scratch and surfacing an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The upstream producer ended cleanly; resubscribe from scratch.
    UpstreamEnded,
    /// The upstream producer failed.
    UpstreamFailed,
    /// The leadership this subscription was opened under no longer exists
    /// (leader crash, lease expiry, store partition or node shutdown).
    LeadershipLost,
}

/// A live subscription to one channel, yielding filtered events until a
/// terminal [`SubscriptionEvent::Closed`].
///
/// The leadership id recorded at subscribe time is frozen for the handle's
/// lifetime; dropping the handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: Channel,
    leadership: LeadershipId,
    id: u64,
    events: mpsc::Receiver<SubscriptionEvent>,
    retire: mpsc::UnboundedSender<Retirement>,
}

impl Subscription {
    pub(crate) fn new(
        channel: Channel,
        leadership: LeadershipId,
        id: u64,
        events: mpsc::Receiver<SubscriptionEvent>,
        retire: mpsc::UnboundedSender<Retirement>,
    ) -> Self {
        Self {
            channel,
            leadership,
            id,
            events,
            retire,
        }
    }

    /// The channel this subscription delivers.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The leadership id this subscription was opened under.
    #[must_use]
    pub fn leadership(&self) -> &LeadershipId {
        &self.leadership
    }

    /// Explicit unsubscribe; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.retire.send(Retirement {
            channel: self.channel.clone(),
            id: self.id,
        });
    }
}

/// Sent to the node's maintenance task when a subscription handle is dropped.
pub(crate) struct Retirement {
    pub(crate) channel: Channel,
    pub(crate) id: u64,
}

/// State driving one subscription's combined delivery and watch loop.
pub(crate) struct SubscriptionTask {
    pub(crate) channel: Channel,
    pub(crate) filter: DeliveryFilter,
    /// The node the lease is expected to name: ourselves, or the node the
    /// subscribe was routed to. An owner change is a leadership change even
    /// if observed before the id catches up.
    pub(crate) expected_owner: NodeId,
    pub(crate) deliveries: PublicationStream,
    pub(crate) events: mpsc::Sender<SubscriptionEvent>,
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) config: Config,
    /// Leader-local terminal signal; `None` on follower nodes.
    pub(crate) signal: Option<watch::Receiver<Option<CloseReason>>>,
    pub(crate) stop: oneshot::Receiver<()>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl SubscriptionTask {
    /// Multiplexes bus delivery, the periodic lease check, the channel-local
    /// terminal signal and teardown. One such task runs per subscription.
    #[tracing::instrument(
        name = "subscription",
        skip(self),
        fields(channel = %self.channel, leadership = %self.filter.expected()),
    )]
    pub(crate) async fn run(mut self) {
        // Spread the re-checks of concurrently created subscriptions out so a
        // leadership change does not produce a thundering herd of reads.
        let jitter = rand::rng().random_range(0.0..0.5);
        let check_interval = self.config.check_interval();
        let mut checks = tokio::time::interval_at(
            tokio::time::Instant::now() + check_interval.mul_f64(1.0 + jitter),
            check_interval,
        );
        checks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut store_failures = 0u32;
        let mut shutdown = self.shutdown;
        let mut stop = self.stop;

        let reason = loop {
            tokio::select! {
                delivery = self.deliveries.next() => match delivery {
                    Some(publication) => {
                        if !self.filter.admits(&publication) {
                            continue;
                        }
                        match publication.frame {
                            Frame::Event(payload) => {
                                if !deliver(&self.events, &self.config, SubscriptionEvent::Message(payload)).await {
                                    return;
                                }
                            }
                            Frame::Ended => break CloseReason::UpstreamEnded,
                            Frame::Failed => break CloseReason::UpstreamFailed,
                        }
                    }
                    // The bus dropped the channel from under us.
                    None => break CloseReason::LeadershipLost,
                },
                _ = checks.tick() => {
                    match check_lease(
                        &self.config,
                        &self.store,
                        &self.channel,
                        &self.filter,
                        &self.expected_owner,
                    ).await {
                        LeaseCheck::Valid => store_failures = 0,
                        LeaseCheck::Gone => break CloseReason::LeadershipLost,
                        LeaseCheck::Unavailable => {
                            store_failures += 1;
                            if store_failures >= self.config.watch_retry_budget() {
                                tracing::warn!(
                                    consecutive = store_failures,
                                    "lease watch budget exhausted, disconnecting"
                                );
                                break CloseReason::LeadershipLost;
                            }
                        }
                    }
                },
                reason = local_signal(&mut self.signal) => break reason,
                _ = util::until_stopping(&mut shutdown) => break CloseReason::LeadershipLost,
                _ = &mut stop => return,
            }
        };

        tracing::debug!(?reason, "subscription closed");
        let _ = deliver(
            &self.events,
            &self.config,
            SubscriptionEvent::Closed(reason),
        )
        .await;
    }
}

/// Bounded write toward the client. Returns `false` when the handle is
/// gone; an undrained client loses the message, not the subscription.
async fn deliver(
    events: &mpsc::Sender<SubscriptionEvent>,
    config: &Config,
    event: SubscriptionEvent,
) -> bool {
    match events.send_timeout(event, config.delivery_timeout()).await {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(_)) => {
            tracing::warn!("subscriber is not draining, dropping event");
            true
        }
        Err(SendTimeoutError::Closed(_)) => false,
    }
}

async fn check_lease(
    config: &Config,
    store: &Arc<dyn LeaseStore>,
    channel: &Channel,
    filter: &DeliveryFilter,
    expected_owner: &NodeId,
) -> LeaseCheck {
    match util::timed(config.store_timeout(), store.get(channel)).await {
        Ok(Some(lease)) if lease.leadership == *filter.expected() && lease.owner == *expected_owner => {
            LeaseCheck::Valid
        }
        Ok(_) => LeaseCheck::Gone,
        Err(err) => {
            tracing::debug!(error = %err, "lease check failed");
            LeaseCheck::Unavailable
        }
    }
}

enum LeaseCheck {
    Valid,
    Gone,
    Unavailable,
}

/// Resolves once the leader-local terminal signal fires; pends forever on
/// follower nodes. A dropped sender counts as leadership lost.
async fn local_signal(rx: &mut Option<watch::Receiver<Option<CloseReason>>>) -> CloseReason {
    match rx {
        Some(rx) => loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::LeadershipLost;
            }
        },
        None => std::future::pending().await,
    }
}
