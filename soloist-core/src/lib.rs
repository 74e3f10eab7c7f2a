//! Core types and collaborator contracts for the soloist channel-leader runtime.
//!
//! Everything a deployment has to provide lives here as a narrow trait behind a
//! capability object: the [`store::LeaseStore`] registry, the
//! [`survey::SurveyTransport`] addressed RPC, the [`bus::PublicationBus`]
//! fan-out and the [`source::EventSource`] upstream producer. The runtime crate
//! consumes these and nothing else, so tests (and single-process deployments)
//! can substitute in-memory implementations with programmable faults.

pub mod bus;
pub mod config;
pub mod identity;
pub mod publication;
pub mod source;
pub mod store;
pub mod survey;

pub use bus::PublicationBus;
pub use config::{Config, ConfigBuilder, InvalidConfig};
pub use identity::{Channel, InvalidChannel, LeadershipId, Lease, NodeId};
pub use publication::{Frame, TaggedPublication};
pub use source::EventSource;
pub use store::LeaseStore;
pub use survey::{SurveyResponder, SurveyTransport};

/// Type-erased error used at the collaborator boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
