//! In-memory lease registry.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use ahash::HashMap;
use async_trait::async_trait;
use soloist_core::{
    store::{AcquireOutcome, LeaseStore, RefreshOutcome, ReleaseOutcome, StoreUnavailable},
    Channel, LeadershipId, Lease, NodeId,
};
use tokio::time::Instant;

/// Linearizable single-process lease store.
///
/// One mutex per store makes every operation atomic; expiry is evaluated
/// lazily against the tokio clock on each access, so paused-time tests can
/// advance straight to interesting instants.
#[derive(Default)]
pub struct MemLeaseStore {
    leases: parking_lot::Mutex<HashMap<Channel, Entry>>,
}

struct Entry {
    leadership: LeadershipId,
    owner: NodeId,
    expires_at: Instant,
}

impl MemLeaseStore {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every lease. Test helper.
    pub fn clear(&self) {
        self.leases.lock().clear();
    }
}

fn live<'a>(leases: &'a mut HashMap<Channel, Entry>, channel: &Channel) -> Option<&'a Entry> {
    if let Some(entry) = leases.get(channel) {
        if entry.expires_at <= Instant::now() {
            leases.remove(channel);
            return None;
        }
    }
    leases.get(channel)
}

fn lease_of(channel: &Channel, entry: &Entry) -> Lease {
    Lease {
        channel: channel.clone(),
        leadership: entry.leadership.clone(),
        owner: entry.owner.clone(),
    }
}

#[async_trait]
impl LeaseStore for MemLeaseStore {
    async fn acquire(
        &self,
        channel: &Channel,
        owner: &NodeId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, StoreUnavailable> {
        let mut leases = self.leases.lock();
        if let Some(entry) = live(&mut leases, channel) {
            return Ok(AcquireOutcome::Held(lease_of(channel, entry)));
        }
        let leadership = LeadershipId::new(xid::new().to_string());
        tracing::debug!(channel = %channel, owner = %owner, leadership = %leadership, "lease acquired");
        leases.insert(channel.clone(), Entry {
            leadership: leadership.clone(),
            owner: owner.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(AcquireOutcome::Acquired(leadership))
    }

    async fn refresh(
        &self,
        channel: &Channel,
        leadership: &LeadershipId,
        ttl: Duration,
    ) -> Result<RefreshOutcome, StoreUnavailable> {
        let mut leases = self.leases.lock();
        if live(&mut leases, channel).is_none() {
            return Ok(RefreshOutcome::NotFound);
        }
        match leases.get_mut(channel) {
            Some(entry) if entry.leadership == *leadership => {
                entry.expires_at = Instant::now() + ttl;
                Ok(RefreshOutcome::Refreshed)
            }
            Some(_) => Ok(RefreshOutcome::Mismatch),
            None => Ok(RefreshOutcome::NotFound),
        }
    }

    async fn release(
        &self,
        channel: &Channel,
        leadership: &LeadershipId,
    ) -> Result<ReleaseOutcome, StoreUnavailable> {
        let mut leases = self.leases.lock();
        if live(&mut leases, channel).is_none() {
            return Ok(ReleaseOutcome::Released);
        }
        match leases.get(channel) {
            Some(entry) if entry.leadership == *leadership => {
                tracing::debug!(channel = %channel, leadership = %leadership, "lease released");
                leases.remove(channel);
                Ok(ReleaseOutcome::Released)
            }
            Some(_) => Ok(ReleaseOutcome::Mismatch),
            None => Ok(ReleaseOutcome::Released),
        }
    }

    async fn get(&self, channel: &Channel) -> Result<Option<Lease>, StoreUnavailable> {
        let mut leases = self.leases.lock();
        Ok(live(&mut leases, channel).map(|entry| lease_of(channel, entry)))
    }
}

/// Wraps any [`LeaseStore`] with a programmable failure switch, so one node's
/// view of the shared store can be cut without touching the others.
pub struct FaultyStore {
    inner: Arc<dyn LeaseStore>,
    faults: Arc<FaultState>,
}

#[derive(Default)]
struct FaultState {
    unavailable: AtomicBool,
    fail_next: AtomicU32,
}

impl FaultyStore {
    /// Wraps `inner`, returning the wrapped store and its control handle.
    pub fn wrap(inner: Arc<dyn LeaseStore>) -> (Arc<Self>, FaultInjector) {
        let faults = Arc::new(FaultState::default());
        let store = Arc::new(Self {
            inner,
            faults: faults.clone(),
        });
        (store, FaultInjector { faults })
    }

    fn check(&self) -> Result<(), StoreUnavailable> {
        if self.faults.unavailable.load(Ordering::Acquire) {
            return Err(StoreUnavailable::new("injected store outage"));
        }
        let take_one = self
            .faults
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if take_one.is_ok() {
            return Err(StoreUnavailable::new("injected transient store failure"));
        }
        Ok(())
    }
}

/// Control handle for a [`FaultyStore`].
pub struct FaultInjector {
    faults: Arc<FaultState>,
}

impl FaultInjector {
    /// Fail every request until turned off again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::Release);
    }

    /// Fail exactly the next `n` requests.
    pub fn fail_next(&self, n: u32) {
        self.faults.fail_next.store(n, Ordering::Release);
    }
}

#[async_trait]
impl LeaseStore for FaultyStore {
    async fn acquire(
        &self,
        channel: &Channel,
        owner: &NodeId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, StoreUnavailable> {
        self.check()?;
        self.inner.acquire(channel, owner, ttl).await
    }

    async fn refresh(
        &self,
        channel: &Channel,
        leadership: &LeadershipId,
        ttl: Duration,
    ) -> Result<RefreshOutcome, StoreUnavailable> {
        self.check()?;
        self.inner.refresh(channel, leadership, ttl).await
    }

    async fn release(
        &self,
        channel: &Channel,
        leadership: &LeadershipId,
    ) -> Result<ReleaseOutcome, StoreUnavailable> {
        self.check()?;
        self.inner.release(channel, leadership).await
    }

    async fn get(&self, channel: &Channel) -> Result<Option<Lease>, StoreUnavailable> {
        self.check()?;
        self.inner.get(channel).await
    }
}
