//! Addressed cross-node RPC used to route subscribe requests to a leader.
//!
//! A survey is delivered to exactly one named node; there is no broadcast.
//! The transport itself never retries (retry is subscription-manager policy)
//! and the callee is idempotent because it re-reads the lease before acting.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    identity::{Channel, LeadershipId, NodeId},
    BoxError,
};

/// A request routed to the node currently named by a channel's lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurveyRequest {
    /// Ask the target to confirm it leads `channel` and report the leadership
    /// id a caller-side subscription should be opened under.
    Subscribe {
        /// The channel the caller wants to subscribe to.
        channel: Channel,
    },
}

/// Application-level answer from the surveyed node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurveyReply {
    /// The target leads the channel under this id.
    Granted {
        /// The target's current leadership id for the channel.
        leadership: LeadershipId,
    },
    /// The target declined; see [`RefusalReason`].
    Refused {
        /// Why the target declined.
        reason: RefusalReason,
    },
}

/// Why a surveyed node declined a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalReason {
    /// The target does not (or no longer does) lead the channel. The caller
    /// fails its subscribe and lets the client retry into a fresh election.
    LeadershipChanged,
    /// The target could not consult its lease store. Transient; the caller
    /// may retry within its survey budget.
    Unavailable,
}

/// Transport-level survey failures.
#[derive(Debug, Error)]
pub enum SurveyError {
    /// No reply arrived within the caller's timeout.
    #[error("survey to {node} timed out")]
    Timeout {
        /// The node that did not answer.
        node: NodeId,
    },
    /// The fabric knows no node by that id.
    #[error("no node {node} is registered with the survey fabric")]
    NoSuchNode {
        /// The unknown node id.
        node: NodeId,
    },
    /// The fabric itself failed to carry the request.
    #[error("survey transport failed")]
    Transport(#[source] BoxError),
}

/// Callee side: a node's handler for surveys addressed to it.
#[async_trait]
pub trait SurveyResponder: Send + Sync + 'static {
    /// Answer one survey. Must be idempotent: the fabric may deliver a
    /// request more than once.
    async fn respond(&self, request: SurveyRequest) -> SurveyReply;
}

/// Capability object for the cluster's addressed RPC fabric.
#[async_trait]
pub trait SurveyTransport: Send + Sync + 'static {
    /// Deliver `request` to the named node and wait up to `timeout` for its
    /// reply. Callers must pick a timeout strictly below the lease TTL.
    async fn survey(
        &self,
        target: &NodeId,
        request: SurveyRequest,
        timeout: Duration,
    ) -> Result<SurveyReply, SurveyError>;

    /// Register `responder` as the handler for surveys addressed to `node`.
    fn serve(&self, node: NodeId, responder: Arc<dyn SurveyResponder>);

    /// Remove a previously registered node; subsequent surveys to it fail
    /// with [`SurveyError::NoSuchNode`].
    fn retire(&self, node: &NodeId);
}
