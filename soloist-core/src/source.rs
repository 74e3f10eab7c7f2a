//! Upstream producer contract.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{identity::Channel, BoxError};

/// Events yielded by an opened producer. The stream ending means the producer
/// closed cleanly; an `Err` item means it failed. Either way the stream is
/// finished and must be reopened from scratch.
pub type EventStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Failures opening or reading an upstream producer.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The producer is already driven by another stream. Producers are
    /// expensive and single-consumer; hitting this from the runtime indicates
    /// two simultaneous leaders, which the lease protocol exists to prevent.
    #[error("upstream producer for {channel} is already claimed")]
    AlreadyClaimed {
        /// The channel whose producer is taken.
        channel: Channel,
    },
    /// The producer reported an error.
    #[error("upstream producer failed")]
    Producer(#[source] BoxError),
}

/// Capability object for the plugin/producer side of a channel.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Open the producer for `channel`. Called only on the node currently
    /// holding the channel's lease.
    async fn open(&self, channel: &Channel) -> Result<EventStream, SourceError>;
}
