//! `MockDispatcher`: a test double for `AgentDispatcher`.
//!
//! Records every request it receives and answers with a programmer-specified
//! outcome.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{AgentDispatcher, DispatchError, traits::{DispatchRequest, SessionHandle}};

/// Behaviour injected into `MockDispatcher` at construction time.
pub enum MockBehaviour {
    /// Accept every request.
    Accept,
    /// Fail the first `failures` calls with `Retryable`, then accept.
    FlakyThenAccept { failures: usize },
    /// Always fail with a `Retryable` error.
    FailRetryable(String),
    /// Always fail with a `Fatal` error.
    FailFatal(String),
}

pub struct MockDispatcher {
    pub behaviour: MockBehaviour,
    /// All requests seen (in call order).
    pub calls: Arc<Mutex<Vec<DispatchRequest>>>,
}

impl MockDispatcher {
    pub fn accepting() -> Self {
        Self::with(MockBehaviour::Accept)
    }

    pub fn flaky(failures: usize) -> Self {
        Self::with(MockBehaviour::FlakyThenAccept { failures })
    }

    pub fn failing_retryable(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailFatal(msg.into()))
    }

    fn with(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Agent roles in the order they were dispatched to.
    pub fn roles(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.agent_role.clone())
            .collect()
    }
}

#[async_trait]
impl AgentDispatcher for MockDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<SessionHandle, DispatchError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(request.clone());
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::Accept => Ok(handle_for(&request, attempt)),
            MockBehaviour::FlakyThenAccept { failures } if attempt <= *failures => {
                Err(DispatchError::Retryable(format!("agent pool busy (attempt {attempt})")))
            }
            MockBehaviour::FlakyThenAccept { .. } => Ok(handle_for(&request, attempt)),
            MockBehaviour::FailRetryable(msg) => Err(DispatchError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg)     => Err(DispatchError::Fatal(msg.clone())),
        }
    }
}

fn handle_for(request: &DispatchRequest, attempt: usize) -> SessionHandle {
    SessionHandle(format!("{}-session-{attempt}", request.agent_role))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn request(role: &str) -> DispatchRequest {
        DispatchRequest {
            agent_role: role.into(),
            work_item_id: Uuid::new_v4(),
            stage_instance_id: Uuid::new_v4(),
            task: "review the diff".into(),
            context: json!({}),
        }
    }

    #[tokio::test]
    async fn accepting_mock_records_calls() {
        let mock = MockDispatcher::accepting();
        let handle = mock.dispatch(request("reviewer")).await.unwrap();
        assert_eq!(handle, SessionHandle("reviewer-session-1".into()));
        assert_eq!(mock.roles(), vec!["reviewer"]);
    }

    #[tokio::test]
    async fn flaky_mock_recovers_after_failures() {
        let mock = MockDispatcher::flaky(2);
        assert!(matches!(mock.dispatch(request("dev")).await, Err(DispatchError::Retryable(_))));
        assert!(matches!(mock.dispatch(request("dev")).await, Err(DispatchError::Retryable(_))));
        assert!(mock.dispatch(request("dev")).await.is_ok());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn fatal_mock_always_fails() {
        let mock = MockDispatcher::failing_fatal("unknown role");
        assert_eq!(
            mock.dispatch(request("ghost")).await,
            Err(DispatchError::Fatal("unknown role".into()))
        );
    }
}
