//! Leader election and stream lifecycle for live channels.
//!
//! Every channel is fed by an upstream producer that must be driven by exactly
//! one stream across the whole cluster, no matter how many nodes host
//! subscribers for it. A [`Node`] coordinates this through the collaborator
//! contracts in [`soloist_core`]: it elects a leader per channel by creating a
//! lease in the shared store, routes subscribes on other nodes to that leader
//! over the survey fabric, runs the single upstream stream on the leader and
//! republishes its events tagged with the leadership id, and tears everything
//! down within bounded time when the leader, the store or the upstream goes
//! away.
//!
//! ```rust,ignore
//! let node = Node::spawn(NodeId::new("fe-1"), config, store, survey, bus, source);
//! let mut sub = node.subscribe(&Channel::new("metrics/cpu")?).await?;
//! while let Some(event) = sub.next().await {
//!     match event {
//!         SubscriptionEvent::Message(payload) => write_to_client(payload),
//!         SubscriptionEvent::Closed(reason) => return reconnect(reason),
//!     }
//! }
//! ```

pub mod filter;
mod leadership;
pub mod node;
mod state;
mod stream;
pub mod subscription;
mod util;

pub use filter::DeliveryFilter;
pub use node::Node;
pub use stream::StreamPhase;
pub use subscription::{CloseReason, SubscribeError, Subscription, SubscriptionEvent};
