//! Tagged messages traveling on the publication bus.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::identity::{Channel, LeadershipId};

/// A single message emitted by a channel's leader.
///
/// Every publication carries the leadership id the stream runner held at time
/// of emission. Delivery filters compare it against the id a subscription was
/// opened under and silently drop mismatches, which absorbs stale in-flight
/// traffic during leadership turnover.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedPublication {
    /// The channel the message belongs to.
    pub channel: Channel,
    /// The emitting stream's leadership id at time of emission.
    pub leadership: LeadershipId,
    /// The message itself.
    pub frame: Frame,
}

/// Payload of a [`TaggedPublication`].
///
/// `Ended` and `Failed` are terminal control frames published once when the
/// upstream producer finishes; they let follower nodes distinguish a clean end
/// (resubscribe from scratch) from an upstream error without waiting for the
/// lease to vanish. Either may be lost in flight; the lease watch loop remains
/// the fallback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// An upstream event payload.
    Event(Bytes),
    /// The upstream producer ended cleanly.
    Ended,
    /// The upstream producer failed.
    Failed,
}

impl TaggedPublication {
    /// A [`Frame::Event`] publication carrying `payload`.
    pub fn event(channel: Channel, leadership: LeadershipId, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            leadership,
            frame: Frame::Event(payload.into()),
        }
    }
}
