//! Cluster-wide lease registry contract.
//!
//! The lease store is the only globally mutable surface in the system: a
//! key-value registry mapping each channel to its current leadership record,
//! with atomic create-if-absent and compare-and-set update/delete keyed on
//! `(channel, leadership)`. Implementations must make [`LeaseStore::acquire`]
//! linearizable per channel; [`LeaseStore::get`] may serve reads up to one TTL
//! stale, which is why every acceptance path in the runtime revalidates after
//! recording an id.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    identity::{Channel, LeadershipId, Lease, NodeId},
    BoxError,
};

/// Outcome of [`LeaseStore::acquire`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease was created and a fresh leadership id minted.
    Acquired(LeadershipId),
    /// A non-expired lease already exists; the caller proceeds as a follower.
    Held(Lease),
}

/// Outcome of [`LeaseStore::refresh`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Expiry extended; `expires_at - now` is at least the requested TTL.
    Refreshed,
    /// No lease exists for the channel; the caller's term expired or was
    /// deleted.
    NotFound,
    /// A lease exists but under a different leadership id.
    Mismatch,
}

/// Outcome of [`LeaseStore::release`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lease was deleted, or no lease existed (release is idempotent).
    Released,
    /// A lease exists under a different leadership id and was left alone.
    Mismatch,
}

/// The store could not serve the request. Always transient: callers retry
/// within their configured budget and otherwise fall back on TTL expiry.
#[derive(Debug, Error)]
#[error("lease store unavailable")]
pub struct StoreUnavailable {
    /// What the store reported, or the timeout that cut the request short.
    #[source]
    pub source: BoxError,
}

impl StoreUnavailable {
    /// Wraps the underlying failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Capability object for the shared lease registry.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Create-if-absent. Mints a fresh leadership id on success; on failure
    /// returns the winning lease so the loser can proceed as a follower.
    ///
    /// Concurrent acquires for one channel are mutually exclusive: whichever
    /// write the store commits first wins.
    async fn acquire(
        &self,
        channel: &Channel,
        owner: &NodeId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, StoreUnavailable>;

    /// Extend the lease expiry iff the stored `(channel, leadership)` matches.
    async fn refresh(
        &self,
        channel: &Channel,
        leadership: &LeadershipId,
        ttl: Duration,
    ) -> Result<RefreshOutcome, StoreUnavailable>;

    /// Delete the lease iff the stored `(channel, leadership)` matches.
    /// Releasing an absent lease is a no-op reported as `Released`.
    async fn release(
        &self,
        channel: &Channel,
        leadership: &LeadershipId,
    ) -> Result<ReleaseOutcome, StoreUnavailable>;

    /// Best-effort read of the current lease. `None` means no non-expired
    /// lease exists. Reads may be stale up to one TTL.
    async fn get(&self, channel: &Channel) -> Result<Option<Lease>, StoreUnavailable>;
}
