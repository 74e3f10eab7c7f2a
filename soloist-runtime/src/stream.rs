//! The single upstream stream a leader runs per channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::StreamExt;
use soloist_core::{
    bus::PublicationBus, source::EventSource, store::LeaseStore, Channel, Config, Frame,
    LeadershipId, TaggedPublication,
};
use tokio::sync::watch;

use crate::{subscription::CloseReason, util};

/// Observable lifecycle of a stream runner.
///
/// Entry to `Running` precedes the first publish; exit from `Running`
/// precedes the lease release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    /// The runner has not started yet.
    Idle,
    /// Waiting for the upstream producer to open.
    Opening,
    /// Consuming upstream events and publishing them.
    Running,
    /// Winding down; no further publishes.
    Terminating,
    /// Done. The seat is purged on the next establish.
    Closed,
}

/// Drives the upstream producer for one leader-held channel and republishes
/// every event tagged with the current leadership id.
///
/// The runner never reconnects: whatever way upstream finishes, it stands the
/// leadership down and lets the next interested subscribe anywhere in the
/// cluster drive a fresh election with a fresh id.
pub(crate) struct StreamRunner {
    pub(crate) channel: Channel,
    pub(crate) leadership: LeadershipId,
    pub(crate) source: Arc<dyn EventSource>,
    pub(crate) bus: Arc<dyn PublicationBus>,
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) config: Config,
    pub(crate) stop: Arc<watch::Sender<bool>>,
    pub(crate) lost: Arc<AtomicBool>,
    pub(crate) signal: Arc<watch::Sender<Option<CloseReason>>>,
    pub(crate) phase: watch::Sender<StreamPhase>,
}

impl StreamRunner {
    #[tracing::instrument(
        name = "stream",
        skip(self),
        fields(channel = %self.channel, leadership = %self.leadership),
    )]
    pub(crate) async fn run(self) {
        let mut stop = self.stop.subscribe();
        self.set_phase(StreamPhase::Opening);

        let opened = tokio::select! {
            _ = util::until_stopping(&mut stop) => {
                self.set_phase(StreamPhase::Terminating);
                self.set_phase(StreamPhase::Closed);
                return;
            }
            opened = tokio::time::timeout(
                self.config.open_timeout(),
                self.source.open(&self.channel),
            ) => opened,
        };
        let mut events = match opened {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "upstream producer refused to open");
                self.finish(CloseReason::UpstreamFailed).await;
                return;
            }
            Err(_elapsed) => {
                tracing::warn!("upstream producer open timed out");
                self.finish(CloseReason::UpstreamFailed).await;
                return;
            }
        };

        self.set_phase(StreamPhase::Running);
        let reason = loop {
            tokio::select! {
                // Stopped from outside: leadership lost or last local
                // subscriber gone. The caller owns the release decision.
                _ = util::until_stopping(&mut stop) => {
                    self.set_phase(StreamPhase::Terminating);
                    drop(events);
                    self.set_phase(StreamPhase::Closed);
                    return;
                }
                item = events.next() => match item {
                    Some(Ok(payload)) => {
                        let publication = TaggedPublication::event(
                            self.channel.clone(),
                            self.leadership.clone(),
                            payload,
                        );
                        if !self.publish(publication).await {
                            break CloseReason::UpstreamFailed;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "upstream producer failed");
                        break CloseReason::UpstreamFailed;
                    }
                    None => {
                        tracing::debug!("upstream producer ended cleanly");
                        break CloseReason::UpstreamEnded;
                    }
                },
            }
        };
        drop(events);
        self.finish(reason).await;
    }

    /// Bounded bus write. A fan-out that cannot accept events makes the
    /// stream useless, so a failure ends it.
    async fn publish(&self, publication: TaggedPublication) -> bool {
        match tokio::time::timeout(self.config.delivery_timeout(), self.bus.publish(publication))
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "publication bus rejected event, ending stream");
                false
            }
            Err(_elapsed) => {
                tracing::error!("publication bus write timed out, ending stream");
                false
            }
        }
    }

    /// Terminal sequence for an upstream-driven end: publish the
    /// distinguishable control frame, stop the refresh task, give the lease
    /// back and signal leader-local subscriptions.
    async fn finish(&self, reason: CloseReason) {
        self.set_phase(StreamPhase::Terminating);

        let frame = match reason {
            CloseReason::UpstreamEnded => Frame::Ended,
            _ => Frame::Failed,
        };
        let terminal = TaggedPublication {
            channel: self.channel.clone(),
            leadership: self.leadership.clone(),
            frame,
        };
        if let Ok(Err(err)) = tokio::time::timeout(
            self.config.delivery_timeout(),
            self.bus.publish(terminal),
        )
        .await
        {
            tracing::debug!(error = %err, "could not publish terminal frame");
        }

        self.stop.send_replace(true);
        if !self.lost.load(Ordering::Acquire) {
            if let Err(err) = util::timed(
                self.config.store_timeout(),
                self.store.release(&self.channel, &self.leadership),
            )
            .await
            {
                // The lease will expire on its own within one TTL.
                tracing::warn!(error = %err, "could not release lease after stream end");
            }
        }
        self.signal.send_replace(Some(reason));
        self.set_phase(StreamPhase::Closed);
    }

    fn set_phase(&self, phase: StreamPhase) {
        tracing::trace!(?phase, "stream phase change");
        self.phase.send_replace(phase);
    }
}
