//! In-memory implementations of the soloist collaborator contracts.
//!
//! These back the test suite (with programmable fault injection) and double
//! as the fabric for single-process deployments where all "nodes" share one
//! address space: the lease store is linearizable because it is one mutex,
//! the survey fabric routes by node id, and the bus fans out over a broadcast
//! channel per channel.

pub mod bus;
pub mod source;
pub mod store;
pub mod survey;

pub use bus::MemBus;
pub use source::MemEventSource;
pub use store::{FaultInjector, FaultyStore, MemLeaseStore};
pub use survey::MemSurveyFabric;
