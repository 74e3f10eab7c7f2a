//! In-memory publication fan-out.

use async_broadcast::InactiveReceiver;
use async_trait::async_trait;
use futures::StreamExt;
use soloist_core::{
    bus::{BusError, PublicationBus, PublicationStream},
    Channel, TaggedPublication,
};

/// Per-channel buffered broadcast depth. Laggards overflow and lose the
/// oldest messages; the bus promises no persistence.
const CHANNEL_CAPACITY: usize = 256;

/// Broadcast-channel bus: one `async-broadcast` channel per soloist channel,
/// kept open by an inactive anchor receiver so publishing into a channel
/// nobody watches yet is not an error.
#[derive(Default)]
pub struct MemBus {
    channels: parking_lot::Mutex<ahash::HashMap<Channel, BusChannel>>,
}

struct BusChannel {
    tx: async_broadcast::Sender<TaggedPublication>,
    _anchor: InactiveReceiver<TaggedPublication>,
}

impl MemBus {
    /// A bus with no channels yet; channels appear on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &Channel) -> async_broadcast::Sender<TaggedPublication> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.clone())
            .or_insert_with(new_bus_channel)
            .tx
            .clone()
    }

    fn receiver(&self, channel: &Channel) -> async_broadcast::Receiver<TaggedPublication> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.clone())
            .or_insert_with(new_bus_channel)
            .tx
            .new_receiver()
    }
}

fn new_bus_channel() -> BusChannel {
    let (mut tx, rx) = async_broadcast::broadcast(CHANNEL_CAPACITY);
    tx.set_overflow(true);
    tx.set_await_active(false);
    BusChannel {
        tx,
        _anchor: rx.deactivate(),
    }
}

#[async_trait]
impl PublicationBus for MemBus {
    async fn publish(&self, publication: TaggedPublication) -> Result<(), BusError> {
        let tx = self.sender(&publication.channel);
        tx.broadcast_direct(publication)
            .await
            .map(|_| ())
            .map_err(|err| BusError::new(err.to_string()))
    }

    fn subscribe(&self, channel: &Channel) -> PublicationStream {
        self.receiver(channel).boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use soloist_core::{
        bus::PublicationBus, Channel, Frame, LeadershipId, TaggedPublication,
    };

    use super::MemBus;

    fn publication(channel: &str, payload: &str) -> TaggedPublication {
        TaggedPublication::event(
            Channel::new(channel).unwrap(),
            LeadershipId::new("term"),
            payload.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber_in_order() {
        let bus = MemBus::new();
        let channel = Channel::new("ch").unwrap();
        let mut first = bus.subscribe(&channel);
        let mut second = bus.subscribe(&channel);

        bus.publish(publication("ch", "a")).await.unwrap();
        bus.publish(publication("ch", "b")).await.unwrap();

        for rx in [&mut first, &mut second] {
            let got = rx.next().await.unwrap();
            assert_eq!(got.frame, Frame::Event("a".into()));
            let got = rx.next().await.unwrap();
            assert_eq!(got.frame, Frame::Event("b".into()));
        }
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = MemBus::new();
        let mut other = bus.subscribe(&Channel::new("other").unwrap());
        bus.publish(publication("ch", "a")).await.unwrap();
        bus.publish(publication("other", "b")).await.unwrap();
        let got = other.next().await.unwrap();
        assert_eq!(got.frame, Frame::Event("b".into()));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let bus = MemBus::new();
        bus.publish(publication("ch", "a")).await.unwrap();
    }
}
