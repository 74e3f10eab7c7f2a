//! Fan-out of tagged publications from a leader to every interested node.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{identity::Channel, publication::TaggedPublication, BoxError};

/// Per-subscription delivery stream handed out by [`PublicationBus::subscribe`].
pub type PublicationStream = BoxStream<'static, TaggedPublication>;

/// The bus could not accept or carry a publication.
#[derive(Debug, Error)]
#[error("publication bus failed")]
pub struct BusError {
    /// What the fabric reported.
    #[source]
    pub source: BoxError,
}

impl BusError {
    /// Wraps the underlying failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Capability object for the cluster-wide publication fan-out.
///
/// Delivery is unordered across nodes but ordered per `(channel, leader)`
/// within a node. Nothing is persisted: a message published while a subscribe
/// is still being set up is legitimately lost.
#[async_trait]
pub trait PublicationBus: Send + Sync + 'static {
    /// Leader-side: hand a tagged publication to the fabric.
    async fn publish(&self, publication: TaggedPublication) -> Result<(), BusError>;

    /// Open a delivery stream for one channel on this node. The stream ends
    /// when the bus drops the channel.
    fn subscribe(&self, channel: &Channel) -> PublicationStream;
}
