//! Per-channel state records.

use std::sync::{atomic::AtomicBool, Arc};

use ahash::HashMap;
use soloist_core::LeadershipId;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::{stream::StreamPhase, subscription::CloseReason};

/// Everything a node knows about one channel.
///
/// `establish` serializes the locate/elect sequence per channel so two local
/// subscribes cannot race an acquire; `record` guards the live handles and is
/// never held across an await.
#[derive(Default)]
pub(crate) struct ChannelState {
    pub(crate) establish: tokio::sync::Mutex<()>,
    pub(crate) record: parking_lot::Mutex<ChannelRecord>,
}

#[derive(Default)]
pub(crate) struct ChannelRecord {
    pub(crate) subscriptions: HashMap<u64, SubscriptionEntry>,
    /// Present iff this node currently leads the channel.
    pub(crate) seat: Option<LeaderSeat>,
}

pub(crate) struct SubscriptionEntry {
    pub(crate) stop: Option<oneshot::Sender<()>>,
    pub(crate) task: JoinHandle<()>,
}

/// Leader-side machinery for one channel: the refresh task, the stream task
/// and the shared signals binding them together.
pub(crate) struct LeaderSeat {
    pub(crate) leadership: LeadershipId,
    /// Set to `true` to stop both tasks. The stream task also raises it when
    /// upstream finishes, and the refresh task when leadership is lost.
    pub(crate) stop: Arc<watch::Sender<bool>>,
    /// Terminal close reason fanned out to leader-local subscriptions.
    pub(crate) signal: Arc<watch::Sender<Option<CloseReason>>>,
    /// Raised when leadership was lost rather than given up; a lost lease is
    /// never released.
    pub(crate) lost: Arc<AtomicBool>,
    pub(crate) phase: watch::Receiver<StreamPhase>,
    pub(crate) refresh_task: JoinHandle<()>,
    pub(crate) stream_task: JoinHandle<()>,
}

impl LeaderSeat {
    /// A seat is terminal once either of its tasks published a close reason;
    /// it no longer accepts joiners and is purged on the next establish.
    pub(crate) fn is_terminal(&self) -> bool {
        self.signal.borrow().is_some()
    }

    pub(crate) fn leadership_id(&self) -> LeadershipId {
        self.leadership.clone()
    }
}
