//! `LogDispatcher`: accepts every task and only writes it to the log.
//! Used by dry runs where no agent pool is attached.

use async_trait::async_trait;
use tracing::info;

use crate::{AgentDispatcher, DispatchError, traits::{DispatchRequest, SessionHandle}};

#[derive(Debug, Default, Clone)]
pub struct LogDispatcher;

#[async_trait]
impl AgentDispatcher for LogDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<SessionHandle, DispatchError> {
        info!(
            agent_role = %request.agent_role,
            work_item_id = %request.work_item_id,
            stage_instance_id = %request.stage_instance_id,
            "dispatch: {}",
            request.task
        );
        Ok(SessionHandle(format!("dry-run-{}", request.stage_instance_id)))
    }
}
