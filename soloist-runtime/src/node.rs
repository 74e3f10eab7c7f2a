//! The per-node coordination surface.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use ahash::HashMap;
use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use soloist_core::{
    bus::PublicationBus,
    source::EventSource,
    store::{AcquireOutcome, LeaseStore, StoreUnavailable},
    survey::{
        RefusalReason, SurveyError, SurveyReply, SurveyRequest, SurveyResponder, SurveyTransport,
    },
    Channel, Config, LeadershipId, Lease, NodeId,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    filter::DeliveryFilter,
    leadership::RefreshTask,
    state::{ChannelState, LeaderSeat, SubscriptionEntry},
    stream::{StreamPhase, StreamRunner},
    subscription::{CloseReason, Retirement, SubscribeError, Subscription, SubscriptionTask},
    util,
};

/// Buffered events per subscription before the delivery timeout starts
/// dropping.
const EVENT_BUFFER: usize = 64;

const SURVEY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One cluster node's view of the channel-leader protocol.
///
/// A node hosts subscriptions for clients connected to it, leads the channels
/// it won elections for, and answers surveys about them. All collaborator
/// fabrics are injected as capability objects; the node owns no I/O of its
/// own.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Wire up a node and register it with the survey fabric.
    #[must_use = "a node without subscribers does nothing; keep the handle to subscribe and shut down"]
    pub fn spawn(
        id: NodeId,
        config: Config,
        store: Arc<dyn LeaseStore>,
        survey: Arc<dyn SurveyTransport>,
        bus: Arc<dyn PublicationBus>,
        source: Arc<dyn EventSource>,
    ) -> Self {
        let (retire_tx, retire_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(NodeInner {
            id: id.clone(),
            config,
            store,
            survey,
            bus,
            source,
            channels: parking_lot::Mutex::new(HashMap::default()),
            next_subscription: AtomicU64::new(0),
            retire_tx,
            shutdown: shutdown_tx,
        });
        inner.survey.serve(
            id,
            Arc::new(NodeResponder {
                node: Arc::downgrade(&inner),
            }),
        );
        tokio::spawn(maintenance(Arc::downgrade(&inner), retire_rx, shutdown_rx));
        tracing::info!(node = %inner.id, "node started");
        Self { inner }
    }

    /// This node's cluster identity.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Open a subscription for a client connected to this node.
    ///
    /// Locates or elects the channel's leader, records the leadership id the
    /// subscription is frozen to, and starts its delivery/watch task.
    ///
    /// # Errors
    ///
    /// [`SubscribeError::LeadershipChanged`] when leadership moved while the
    /// subscribe was in flight (the client simply retries), or a transient
    /// store/survey failure that outlived its retry budget.
    pub async fn subscribe(&self, channel: &Channel) -> Result<Subscription, SubscribeError> {
        self.inner.subscribe(channel).await
    }

    /// Whether this node currently leads `channel`.
    #[must_use]
    pub fn is_leader(&self, channel: &Channel) -> bool {
        self.inner.live_seat(channel, LeaderSeat::leadership_id).is_some()
    }

    /// The leadership id this node currently holds for `channel`, if any.
    #[must_use]
    pub fn leadership(&self, channel: &Channel) -> Option<LeadershipId> {
        self.inner.live_seat(channel, LeaderSeat::leadership_id)
    }

    /// The stream runner phase for a channel this node leads.
    #[must_use]
    pub fn stream_phase(&self, channel: &Channel) -> Option<StreamPhase> {
        let channels = self.inner.channels.lock();
        let state = channels.get(channel)?;
        let record = state.record.lock();
        record.seat.as_ref().map(|seat| *seat.phase.borrow())
    }

    /// Number of local subscriptions for `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        let channels = self.inner.channels.lock();
        channels
            .get(channel)
            .map_or(0, |state| state.record.lock().subscriptions.len())
    }

    /// Graceful shutdown: close every subscription, stop led streams and
    /// release their leases. Resolves within the shutdown grace per channel.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        tracing::info!(node = %self.inner.id, "node shutting down");
        self.inner.survey.retire(&self.inner.id);
        let states: Vec<_> = self.inner.channels.lock().drain().collect();
        for (channel, state) in states {
            let _establishing = state.establish.lock().await;
            let (entries, seat) = {
                let mut record = state.record.lock();
                let entries: Vec<_> = record.subscriptions.drain().collect();
                (entries, record.seat.take())
            };
            for (_, mut entry) in entries {
                // The shutdown watch closes the task with a terminal event;
                // keep the stop sender alive meanwhile, dropping it would
                // close the task silently instead.
                util::join_within(self.inner.config.shutdown_grace(), &mut entry.task).await;
            }
            if let Some(seat) = seat {
                self.inner.dismantle_seat(&channel, seat, true).await;
            }
        }
    }

    /// Abandon everything immediately: no lease releases, no terminal events.
    ///
    /// Leases this node held lapse by TTL and the cluster re-elects, exactly
    /// as after a crash. Meant for failover drills and tests.
    pub fn halt(&self) {
        tracing::warn!(node = %self.inner.id, "node halting");
        // Raise the flag before draining, as shutdown does, so an in-flight
        // subscribe cannot install a seat into a map nobody drains again.
        self.inner.shutdown.send_replace(true);
        self.inner.survey.retire(&self.inner.id);
        let states: Vec<_> = self.inner.channels.lock().drain().collect();
        for (_, state) in states {
            let mut record = state.record.lock();
            for (_, entry) in record.subscriptions.drain() {
                entry.task.abort();
            }
            if let Some(seat) = record.seat.take() {
                seat.refresh_task.abort();
                seat.stream_task.abort();
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("id", &self.inner.id).finish()
    }
}

struct NodeInner {
    id: NodeId,
    config: Config,
    store: Arc<dyn LeaseStore>,
    survey: Arc<dyn SurveyTransport>,
    bus: Arc<dyn PublicationBus>,
    source: Arc<dyn EventSource>,
    channels: parking_lot::Mutex<HashMap<Channel, Arc<ChannelState>>>,
    next_subscription: AtomicU64,
    retire_tx: mpsc::UnboundedSender<Retirement>,
    shutdown: watch::Sender<bool>,
}

/// Leadership id and local-signal receiver a subscription is opened with.
struct Established {
    leadership: LeadershipId,
    owner: NodeId,
    signal: Option<watch::Receiver<Option<CloseReason>>>,
}

impl NodeInner {
    async fn subscribe(&self, channel: &Channel) -> Result<Subscription, SubscribeError> {
        if *self.shutdown.borrow() {
            return Err(SubscribeError::ShuttingDown);
        }
        loop {
            let state = self.channel_state(channel);
            let _establishing = state.establish.lock().await;
            // Re-check under the lock: shutdown raises the flag before it
            // drains the channel map, so a false reading here means the drain
            // has not started and will wait on this establish lock.
            if *self.shutdown.borrow() {
                return Err(SubscribeError::ShuttingDown);
            }
            {
                // A concurrent retirement may have dropped this record from
                // the node while we waited for the establish lock.
                let channels = self.channels.lock();
                match channels.get(channel) {
                    Some(current) if Arc::ptr_eq(current, &state) => {}
                    _ => continue,
                }
            }
            return self.subscribe_locked(channel, &state).await;
        }
    }

    /// Runs under the channel's establish lock.
    async fn subscribe_locked(
        &self,
        channel: &Channel,
        state: &ChannelState,
    ) -> Result<Subscription, SubscribeError> {
        let established = self.establish(channel, state).await?;
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = SubscriptionTask {
            channel: channel.clone(),
            filter: DeliveryFilter::new(established.leadership.clone()),
            expected_owner: established.owner,
            deliveries: self.bus.subscribe(channel),
            events: events_tx,
            store: self.store.clone(),
            config: self.config.clone(),
            signal: established.signal,
            stop: stop_rx,
            shutdown: self.shutdown.subscribe(),
        };
        let handle = tokio::spawn(task.run());
        state.record.lock().subscriptions.insert(id, SubscriptionEntry {
            stop: Some(stop_tx),
            task: handle,
        });
        tracing::debug!(
            channel = %channel,
            leadership = %established.leadership,
            subscription = id,
            "subscription opened"
        );
        Ok(Subscription::new(
            channel.clone(),
            established.leadership,
            id,
            events_rx,
            self.retire_tx.clone(),
        ))
    }

    /// Locate or elect the channel's leader and return the leadership id the
    /// new subscription will be frozen to.
    async fn establish(
        &self,
        channel: &Channel,
        state: &ChannelState,
    ) -> Result<Established, SubscribeError> {
        // Purge a terminal seat left over from an earlier leadership term.
        let stale = {
            let mut record = state.record.lock();
            match &record.seat {
                Some(seat) if seat.is_terminal() => record.seat.take(),
                _ => None,
            }
        };
        if let Some(seat) = stale {
            self.dismantle_seat(channel, seat, false).await;
        }

        match self.get_lease(channel).await? {
            Some(lease) if lease.owner == self.id => self.join_local_seat(state, &lease),
            Some(lease) => self.follow(channel, lease).await,
            None => self.elect(channel, state).await,
        }
    }

    /// The lease names us; a new local subscription rides the live seat.
    fn join_local_seat(
        &self,
        state: &ChannelState,
        lease: &Lease,
    ) -> Result<Established, SubscribeError> {
        let record = state.record.lock();
        match &record.seat {
            Some(seat) if seat.leadership == lease.leadership && !seat.is_terminal() => {
                Ok(Established {
                    leadership: seat.leadership.clone(),
                    owner: self.id.clone(),
                    signal: Some(seat.signal.subscribe()),
                })
            }
            // A lease naming us without a matching live seat is a leftover
            // from a previous incarnation; it expires on its own.
            _ => Err(SubscribeError::LeadershipChanged),
        }
    }

    /// No lease exists: run for leadership. Exactly one concurrent acquire
    /// per channel wins cluster-wide; the loser reroutes to the winner.
    async fn elect(
        &self,
        channel: &Channel,
        state: &ChannelState,
    ) -> Result<Established, SubscribeError> {
        let acquired = util::retry_transient(self.config.store_retry_budget(), || {
            util::timed(
                self.config.store_timeout(),
                self.store.acquire(channel, &self.id, self.config.lease_ttl()),
            )
        })
        .await?;
        match acquired {
            AcquireOutcome::Acquired(leadership) => {
                tracing::info!(channel = %channel, leadership = %leadership, "acquired channel leadership");
                // Replace whatever seat may linger from a lapsed term.
                let lingering = state.record.lock().seat.take();
                if let Some(seat) = lingering {
                    self.dismantle_seat(channel, seat, false).await;
                }
                let signal = self.install_seat(state, channel, leadership.clone());

                // Post-accept revalidation: `get` may have been stale when we
                // started, and the lease may already have moved on.
                match self.get_lease(channel).await {
                    Ok(Some(lease)) if lease.leadership == leadership && lease.owner == self.id => {
                        Ok(Established {
                            leadership,
                            owner: self.id.clone(),
                            signal: Some(signal),
                        })
                    }
                    Ok(_) => {
                        let seat = state.record.lock().seat.take();
                        if let Some(seat) = seat {
                            self.dismantle_seat(channel, seat, false).await;
                        }
                        Err(SubscribeError::LeadershipChanged)
                    }
                    Err(err) => {
                        let seat = state.record.lock().seat.take();
                        if let Some(seat) = seat {
                            // We may still hold the lease; give it back rather
                            // than strand the channel for a full TTL.
                            self.dismantle_seat(channel, seat, true).await;
                        }
                        Err(err.into())
                    }
                }
            }
            AcquireOutcome::Held(lease) if lease.owner == self.id => {
                self.join_local_seat(state, &lease)
            }
            AcquireOutcome::Held(lease) => self.follow(channel, lease).await,
        }
    }

    /// Another node leads: route the subscribe to it and revalidate the
    /// granted id against the store before accepting.
    async fn follow(&self, channel: &Channel, lease: Lease) -> Result<Established, SubscribeError> {
        let leadership = self.survey_subscribe(&lease.owner, channel).await?;
        match self.get_lease(channel).await? {
            Some(current) if current.leadership == leadership && current.owner == lease.owner => {
                Ok(Established {
                    leadership,
                    owner: lease.owner,
                    signal: None,
                })
            }
            _ => Err(SubscribeError::LeadershipChanged),
        }
    }

    async fn survey_subscribe(
        &self,
        owner: &NodeId,
        channel: &Channel,
    ) -> Result<LeadershipId, SubscribeError> {
        let mut backoff = ConstantBuilder::default()
            .with_delay(SURVEY_RETRY_DELAY)
            .with_max_times(self.config.survey_retry_budget() as usize)
            .with_jitter()
            .build();
        loop {
            let request = SurveyRequest::Subscribe {
                channel: channel.clone(),
            };
            let outcome = self
                .survey
                .survey(owner, request, self.config.survey_timeout())
                .await;
            let failure = match outcome {
                Ok(SurveyReply::Granted { leadership }) => return Ok(leadership),
                Ok(SurveyReply::Refused {
                    reason: RefusalReason::LeadershipChanged,
                }) => return Err(SubscribeError::LeadershipChanged),
                Ok(SurveyReply::Refused {
                    reason: RefusalReason::Unavailable,
                }) => None,
                Err(err @ (SurveyError::Timeout { .. } | SurveyError::Transport(_))) => Some(err),
                // A node the fabric does not know cannot come back within this
                // subscribe; its lease lapses by TTL.
                Err(err @ SurveyError::NoSuchNode { .. }) => {
                    return Err(SubscribeError::Survey(err))
                }
            };
            match backoff.next() {
                Some(delay) => {
                    tracing::debug!(owner = %owner, channel = %channel, ?delay, "survey attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(match failure {
                        Some(err) => SubscribeError::Survey(err),
                        None => SubscribeError::Store(StoreUnavailable::new(
                            "channel leader could not reach the lease store",
                        )),
                    })
                }
            }
        }
    }

    /// Start the refresh and stream tasks for a freshly won leadership and
    /// park them in the channel record.
    fn install_seat(
        &self,
        state: &ChannelState,
        channel: &Channel,
        leadership: LeadershipId,
    ) -> watch::Receiver<Option<CloseReason>> {
        let (stop, _) = watch::channel(false);
        let stop = Arc::new(stop);
        let (signal, _) = watch::channel(None);
        let signal = Arc::new(signal);
        let signal_rx = signal.subscribe();
        let (phase_tx, phase_rx) = watch::channel(StreamPhase::Idle);
        let lost = Arc::new(AtomicBool::new(false));

        let refresh = RefreshTask {
            channel: channel.clone(),
            leadership: leadership.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            stop: stop.clone(),
            lost: lost.clone(),
            signal: signal.clone(),
        };
        let stream = StreamRunner {
            channel: channel.clone(),
            leadership: leadership.clone(),
            source: self.source.clone(),
            bus: self.bus.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            stop: stop.clone(),
            lost: lost.clone(),
            signal: signal.clone(),
            phase: phase_tx,
        };
        let seat = LeaderSeat {
            leadership,
            stop,
            signal,
            lost,
            phase: phase_rx,
            refresh_task: tokio::spawn(refresh.run()),
            stream_task: tokio::spawn(stream.run()),
        };
        state.record.lock().seat = Some(seat);
        signal_rx
    }

    /// Stop a seat's tasks and optionally give the lease back. Lost
    /// leaderships are never released: the lease either belongs to someone
    /// else or lapses by TTL.
    async fn dismantle_seat(&self, channel: &Channel, mut seat: LeaderSeat, release: bool) {
        seat.stop.send_replace(true);
        let grace = self.config.shutdown_grace();
        util::join_within(grace, &mut seat.stream_task).await;
        util::join_within(grace, &mut seat.refresh_task).await;
        if release && !seat.lost.load(Ordering::Acquire) {
            if let Err(err) = util::timed(
                self.config.store_timeout(),
                self.store.release(channel, &seat.leadership),
            )
            .await
            {
                tracing::warn!(channel = %channel, error = %err, "could not release lease during teardown");
            }
        }
    }

    async fn retire_subscription(&self, retirement: Retirement) {
        let state = {
            let channels = self.channels.lock();
            let Some(state) = channels.get(&retirement.channel) else {
                return;
            };
            state.clone()
        };
        let _establishing = state.establish.lock().await;
        let (entry, seat) = {
            let mut channels = self.channels.lock();
            let mut record = state.record.lock();
            let entry = record.subscriptions.remove(&retirement.id);
            let seat = if record.subscriptions.is_empty() {
                if let Some(current) = channels.get(&retirement.channel) {
                    if Arc::ptr_eq(current, &state) {
                        channels.remove(&retirement.channel);
                    }
                }
                record.seat.take()
            } else {
                None
            };
            (entry, seat)
        };
        if let Some(mut entry) = entry {
            if let Some(stop) = entry.stop.take() {
                let _ = stop.send(());
            }
            util::join_within(self.config.shutdown_grace(), &mut entry.task).await;
        }
        if let Some(seat) = seat {
            tracing::debug!(channel = %retirement.channel, "last local subscriber gone, standing down");
            self.dismantle_seat(&retirement.channel, seat, true).await;
        }
    }

    fn channel_state(&self, channel: &Channel) -> Arc<ChannelState> {
        self.channels
            .lock()
            .entry(channel.clone())
            .or_insert_with(Arc::default)
            .clone()
    }

    fn live_seat<T>(&self, channel: &Channel, read: impl Fn(&LeaderSeat) -> T) -> Option<T> {
        let channels = self.channels.lock();
        let state = channels.get(channel)?;
        let record = state.record.lock();
        record
            .seat
            .as_ref()
            .filter(|seat| !seat.is_terminal())
            .map(read)
    }

    /// Answer a survey: grant only when the store names us owner *and* a live
    /// local seat carries the same id; refuse everything else so the caller
    /// drives a fresh election. Idempotent because it re-reads the lease.
    async fn answer_subscribe(&self, channel: &Channel) -> SurveyReply {
        if *self.shutdown.borrow() {
            return SurveyReply::Refused {
                reason: RefusalReason::LeadershipChanged,
            };
        }
        let lease = match util::timed(self.config.store_timeout(), self.store.get(channel)).await {
            Ok(lease) => lease,
            Err(err) => {
                tracing::debug!(channel = %channel, error = %err, "cannot answer survey, store unavailable");
                return SurveyReply::Refused {
                    reason: RefusalReason::Unavailable,
                };
            }
        };
        match lease {
            Some(lease) if lease.owner == self.id => {
                let granted = self.live_seat(channel, LeaderSeat::leadership_id);
                match granted {
                    Some(leadership) if leadership == lease.leadership => {
                        SurveyReply::Granted { leadership }
                    }
                    _ => SurveyReply::Refused {
                        reason: RefusalReason::LeadershipChanged,
                    },
                }
            }
            _ => SurveyReply::Refused {
                reason: RefusalReason::LeadershipChanged,
            },
        }
    }

    async fn get_lease(&self, channel: &Channel) -> Result<Option<Lease>, StoreUnavailable> {
        util::retry_transient(self.config.store_retry_budget(), || {
            util::timed(self.config.store_timeout(), self.store.get(channel))
        })
        .await
    }
}

struct NodeResponder {
    node: Weak<NodeInner>,
}

#[async_trait]
impl SurveyResponder for NodeResponder {
    async fn respond(&self, request: SurveyRequest) -> SurveyReply {
        let Some(node) = self.node.upgrade() else {
            return SurveyReply::Refused {
                reason: RefusalReason::LeadershipChanged,
            };
        };
        match request {
            SurveyRequest::Subscribe { channel } => node.answer_subscribe(&channel).await,
        }
    }
}

async fn maintenance(
    node: Weak<NodeInner>,
    mut retirements: mpsc::UnboundedReceiver<Retirement>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = crate::util::until_stopping(&mut shutdown) => return,
            retirement = retirements.recv() => match retirement {
                Some(retirement) => {
                    let Some(node) = node.upgrade() else { return };
                    node.retire_subscription(retirement).await;
                }
                None => return,
            },
        }
    }
}
