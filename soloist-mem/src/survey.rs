//! In-memory survey fabric routing by node id.

use std::{sync::Arc, time::Duration};

use ahash::{HashMap, HashSet};
use async_trait::async_trait;
use soloist_core::{
    survey::{SurveyError, SurveyReply, SurveyRequest, SurveyResponder, SurveyTransport},
    NodeId,
};

/// Routes each survey to exactly one registered responder, with a timeout on
/// the callee. Nodes can be partitioned away to simulate an unreachable
/// leader: surveys to a partitioned node burn their full timeout, exactly as
/// a dead network path would.
#[derive(Default)]
pub struct MemSurveyFabric {
    nodes: parking_lot::Mutex<HashMap<NodeId, Arc<dyn SurveyResponder>>>,
    partitioned: parking_lot::Mutex<HashSet<NodeId>>,
}

impl MemSurveyFabric {
    /// An empty fabric with no registered nodes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` unreachable; surveys to it time out.
    pub fn partition(&self, node: &NodeId) {
        self.partitioned.lock().insert(node.clone());
    }

    /// Undo [`MemSurveyFabric::partition`].
    pub fn heal(&self, node: &NodeId) {
        self.partitioned.lock().remove(node);
    }
}

#[async_trait]
impl SurveyTransport for MemSurveyFabric {
    async fn survey(
        &self,
        target: &NodeId,
        request: SurveyRequest,
        timeout: Duration,
    ) -> Result<SurveyReply, SurveyError> {
        if self.partitioned.lock().contains(target) {
            tokio::time::sleep(timeout).await;
            return Err(SurveyError::Timeout {
                node: target.clone(),
            });
        }
        let responder = self
            .nodes
            .lock()
            .get(target)
            .cloned()
            .ok_or_else(|| SurveyError::NoSuchNode {
                node: target.clone(),
            })?;
        match tokio::time::timeout(timeout, responder.respond(request)).await {
            Ok(reply) => Ok(reply),
            Err(_elapsed) => Err(SurveyError::Timeout {
                node: target.clone(),
            }),
        }
    }

    fn serve(&self, node: NodeId, responder: Arc<dyn SurveyResponder>) {
        tracing::debug!(node = %node, "survey responder registered");
        self.nodes.lock().insert(node, responder);
    }

    fn retire(&self, node: &NodeId) {
        tracing::debug!(node = %node, "survey responder retired");
        self.nodes.lock().remove(node);
    }
}
