//! Scriptable upstream producer.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use soloist_core::{
    source::{EventSource, EventStream, SourceError},
    Channel,
};
use tokio::sync::mpsc;

/// An event source fed by test (or host-application) code.
///
/// Enforces the single-consumer producer contract: while one stream for a
/// channel is open, a second [`EventSource::open`] fails with
/// [`SourceError::AlreadyClaimed`]. That makes the cluster-wide
/// one-stream-per-channel invariant directly observable: if two nodes ever
/// believed they both led a channel, the second open would surface here.
#[derive(Default)]
pub struct MemEventSource {
    channels: parking_lot::Mutex<ahash::HashMap<Channel, ProducerSlot>>,
}

#[derive(Default)]
struct ProducerSlot {
    feed: Option<mpsc::UnboundedSender<Result<Bytes, SourceError>>>,
    pending: Option<mpsc::UnboundedReceiver<Result<Bytes, SourceError>>>,
    claim: Option<Arc<AtomicBool>>,
    opens: u32,
}

impl ProducerSlot {
    fn ensure_feed(&mut self) {
        let stale = self.feed.as_ref().is_none_or(|tx| tx.is_closed());
        if stale {
            let (tx, rx) = mpsc::unbounded_channel();
            self.feed = Some(tx);
            self.pending = Some(rx);
        }
    }
}

impl MemEventSource {
    /// A source with no channels yet; slots appear on first push or open.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one event on the channel's current producer generation.
    pub fn push(&self, channel: &Channel, payload: impl Into<Bytes>) {
        let mut channels = self.channels.lock();
        let slot = channels.entry(channel.clone()).or_default();
        slot.ensure_feed();
        if let Some(tx) = &slot.feed {
            let _ = tx.send(Ok(payload.into()));
        }
    }

    /// End the current producer generation cleanly. The open stream drains
    /// its buffered events and then finishes; the next open starts a fresh
    /// generation.
    pub fn end(&self, channel: &Channel) {
        let mut channels = self.channels.lock();
        if let Some(slot) = channels.get_mut(channel) {
            slot.feed = None;
        }
    }

    /// Fail the current producer generation: the open stream yields one
    /// error and then finishes.
    pub fn fail(&self, channel: &Channel, message: &str) {
        let mut channels = self.channels.lock();
        let Some(slot) = channels.get_mut(channel) else {
            return;
        };
        if let Some(tx) = slot.feed.take() {
            let _ = tx.send(Err(SourceError::Producer(message.to_string().into())));
        }
    }

    /// How many times this channel's producer has been opened. The
    /// one-stream-per-channel tests pin this down.
    #[must_use]
    pub fn open_count(&self, channel: &Channel) -> u32 {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |slot| slot.opens)
    }
}

#[async_trait]
impl EventSource for MemEventSource {
    async fn open(&self, channel: &Channel) -> Result<EventStream, SourceError> {
        let mut channels = self.channels.lock();
        let slot = channels.entry(channel.clone()).or_default();
        if slot
            .claim
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
        {
            return Err(SourceError::AlreadyClaimed {
                channel: channel.clone(),
            });
        }
        slot.ensure_feed();
        let mut rx = match slot.pending.take() {
            Some(rx) => rx,
            None => {
                // The previous consumer took the receiver and dropped it
                // without the producer ending; start a fresh generation.
                let (tx, rx) = mpsc::unbounded_channel();
                slot.feed = Some(tx);
                rx
            }
        };
        let claim = Arc::new(AtomicBool::new(true));
        slot.claim = Some(claim.clone());
        slot.opens += 1;
        tracing::debug!(channel = %channel, generation = slot.opens, "producer opened");

        let stream = async_stream::stream! {
            let _claim = ClaimGuard(claim);
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(stream.boxed())
    }
}

struct ClaimGuard(Arc<AtomicBool>);

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use soloist_core::{
        source::{EventSource, SourceError},
        Channel,
    };

    use super::MemEventSource;

    fn channel() -> Channel {
        Channel::new("ch").unwrap()
    }

    #[tokio::test]
    async fn buffers_events_pushed_before_open() {
        let source = MemEventSource::new();
        source.push(&channel(), "early");
        let mut stream = source.open(&channel()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "early");
    }

    #[tokio::test]
    async fn second_concurrent_open_is_refused() {
        let source = MemEventSource::new();
        let _stream = source.open(&channel()).await.unwrap();
        let err = match source.open(&channel()).await {
            Err(err) => err,
            Ok(_) => panic!("expected second open to be refused"),
        };
        assert!(matches!(err, SourceError::AlreadyClaimed { .. }));
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_claim() {
        let source = MemEventSource::new();
        let stream = source.open(&channel()).await.unwrap();
        drop(stream);
        source.open(&channel()).await.unwrap();
        assert_eq!(source.open_count(&channel()), 2);
    }

    #[tokio::test]
    async fn end_finishes_the_stream_after_buffered_events() {
        let source = MemEventSource::new();
        let mut stream = source.open(&channel()).await.unwrap();
        source.push(&channel(), "a");
        source.end(&channel());
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn fail_yields_one_error_then_finishes() {
        let source = MemEventSource::new();
        let mut stream = source.open(&channel()).await.unwrap();
        source.fail(&channel(), "boom");
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn reopening_after_end_starts_a_fresh_generation() {
        let source = MemEventSource::new();
        {
            let mut stream = source.open(&channel()).await.unwrap();
            source.end(&channel());
            assert!(stream.next().await.is_none());
        }
        source.push(&channel(), "next-generation");
        let mut stream = source.open(&channel()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "next-generation");
        assert_eq!(source.open_count(&channel()), 2);
    }
}
