//! The `AgentDispatcher` trait: how a stage's task reaches an agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::DispatchError;

/// Everything an agent needs to pick up one stage instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub agent_role: String,
    pub work_item_id: Uuid,
    pub stage_instance_id: Uuid,
    /// Short instruction for the agent.
    pub task: String,
    /// Stage input plus the work item's initial context.
    pub context: Value,
}

/// Opaque handle to the agent session that accepted the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport to the agent pool. Implementations own their connection
/// handling; the engine only calls this after its transaction committed.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<SessionHandle, DispatchError>;
}
