//! Names and identities: channels, nodes, leadership terms.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named event stream; the unit of leadership.
///
/// Channel names are opaque non-empty strings. Two subscriptions with equal
/// channel names share one upstream stream across the whole cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    /// Validates and wraps a channel name.
    ///
    /// # Errors
    ///
    /// Fails if the name is empty.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidChannel> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidChannel);
        }
        Ok(Self(name))
    }

    /// The channel name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Channel {
    type Error = InvalidChannel;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl TryFrom<&str> for Channel {
    type Error = InvalidChannel;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

/// A channel name failed validation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("channel names may not be empty")]
pub struct InvalidChannel;

/// Identity of a cluster node, stable for the process lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps a node identity. Typically the pod or host name of the process.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The node identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque id minted by the lease store on every successful acquisition.
///
/// A fresh id is minted each time a channel's lease is (re)acquired, so two
/// leases for the same channel never share an id. Equality of ids is the
/// cluster's proof-of-continuity: a subscription opened under one id must
/// never deliver a message tagged with another.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadershipId(String);

impl LeadershipId {
    /// Wraps an id minted by a lease store.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeadershipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A channel's leadership record as read back from the lease store.
///
/// Expiry is store-internal: an expired lease is never returned, and the
/// runtime only reasons about presence, id and owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The channel this lease covers.
    pub channel: Channel,
    /// The id minted when the lease was acquired.
    pub leadership: LeadershipId,
    /// The node holding the lease.
    pub owner: NodeId,
}

#[cfg(test)]
mod tests {
    use super::{Channel, InvalidChannel};

    #[test]
    fn rejects_empty_channel_names() {
        assert_eq!(Channel::new(""), Err(InvalidChannel));
        assert_eq!(Channel::try_from(String::new()), Err(InvalidChannel));
    }

    #[test]
    fn channel_round_trips_through_serde() {
        let channel = Channel::new("plugin/testdata/random-2s-stream").unwrap();
        let json = serde_json::to_string(&channel).unwrap();
        assert_eq!(json, "\"plugin/testdata/random-2s-stream\"");
        assert_eq!(serde_json::from_str::<Channel>(&json).unwrap(), channel);
    }
}
