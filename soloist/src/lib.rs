//! Exactly-one-stream-per-channel coordination for clustered live streaming.
//!
//! Clients subscribe to named channels on whichever front-end node they are
//! connected to; each channel is fed by an upstream producer that must be
//! driven by exactly one stream across the whole cluster. Soloist elects a
//! leader per channel through a leased registry, routes subscribes on other
//! nodes to that leader over an addressed RPC (the survey), republishes the
//! leader's events tagged with a leadership id, and filters every delivery
//! against the tag the subscription was opened under.
//!
//! # Example
//!
//! A two-node cluster over the in-memory fabrics (feature `mem`):
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use soloist::{Channel, ConfigBuilder, Node, NodeId, SubscriptionEvent};
//! use soloist::mem::{MemBus, MemEventSource, MemLeaseStore, MemSurveyFabric};
//!
//! let config = ConfigBuilder::default().finish()?;
//! let (store, survey, bus, source) = (
//!     Arc::new(MemLeaseStore::new()),
//!     Arc::new(MemSurveyFabric::new()),
//!     Arc::new(MemBus::new()),
//!     Arc::new(MemEventSource::new()),
//! );
//! let n1 = Node::spawn(NodeId::new("fe-1"), config.clone(),
//!     store.clone(), survey.clone(), bus.clone(), source.clone());
//! let n2 = Node::spawn(NodeId::new("fe-2"), config,
//!     store, survey, bus, source.clone());
//!
//! let channel = Channel::new("metrics/cpu")?;
//! let mut a = n1.subscribe(&channel).await?; // n1 elects itself leader
//! let mut b = n2.subscribe(&channel).await?; // n2 follows via survey
//! assert_eq!(a.leadership(), b.leadership());
//!
//! source.push(&channel, "payload");
//! assert!(matches!(b.next().await, Some(SubscriptionEvent::Message(_))));
//! ```

pub use soloist_core as core;
pub use soloist_runtime as runtime;

#[cfg(feature = "mem")] pub use soloist_mem as mem;

#[doc(inline)]
pub use soloist_core::{
    Channel, Config, ConfigBuilder, InvalidChannel, InvalidConfig, LeadershipId, Lease, NodeId,
    TaggedPublication,
};
#[doc(inline)]
pub use soloist_runtime::{
    CloseReason, DeliveryFilter, Node, StreamPhase, SubscribeError, Subscription,
    SubscriptionEvent,
};
