//! Transaction and dispatch wrapper around [`WorkflowExecutor`].
//!
//! Every call runs the executor inside one store transaction, commits it,
//! and only then hands the next stage to the agent pool. Dispatch failures
//! are logged and reported in the returned [`Step`]; they never undo the
//! committed transition.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use agents::{AgentDispatcher, DispatchError, DispatchRequest, SessionHandle};
use db::{Store, StoreTx, models::WorkItemStatus};

use crate::{
    EngineError,
    executor::{AdvanceOutcome, WorkflowExecutor},
    models::{ExecutionContext, InitialContext, StageResult},
    selector::{Selection, SelectionInput, select},
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry policy for retryable dispatch failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl DispatchConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The work item shipped or is waiting on a human.
    NotRequired,
    Dispatched(SessionHandle),
    /// Retries exhausted or a fatal error. The transition stays committed.
    Failed(String),
}

/// One committed transition plus what happened when dispatching it.
#[derive(Debug, Clone)]
pub struct Step {
    /// Set by [`Orchestrator::start`] only.
    pub selection: Option<Selection>,
    pub outcome: AdvanceOutcome,
    pub dispatch: DispatchStatus,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<S, D> {
    store: S,
    dispatcher: D,
    executor: WorkflowExecutor,
    config: DispatchConfig,
}

impl<S: Store, D: AgentDispatcher> Orchestrator<S, D> {
    pub fn new(store: S, dispatcher: D, executor: WorkflowExecutor, config: DispatchConfig) -> Self {
        Self { store, dispatcher, executor, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Select a workflow for a pending work item and enter it.
    ///
    /// # Errors
    /// Selection and executor errors, after which nothing is committed.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        work_item_id: Uuid,
        requested_workflow_id: Option<&str>,
    ) -> Result<Step, EngineError> {
        let mut tx = self.store.begin().await?;
        let staged = self.start_in(&mut tx, work_item_id, requested_workflow_id).await;
        let (selection, outcome) = settle(tx, staged).await?;

        let dispatch = self.dispatch(outcome.dispatch.clone()).await;
        Ok(Step { selection: Some(selection), outcome, dispatch })
    }

    async fn start_in(
        &self,
        tx: &mut S::Tx,
        work_item_id: Uuid,
        requested_workflow_id: Option<&str>,
    ) -> Result<(Selection, AdvanceOutcome), EngineError> {
        let item = tx.get_work_item(work_item_id).await?;
        let mut input = SelectionInput::from_work_item(&item);
        if let Some(id) = requested_workflow_id {
            input = input.requesting(id);
        }

        let selection = select(&input, self.executor.definitions())?;
        info!(
            "selected workflow '{}' ({}{})",
            selection.workflow_id,
            selection.reason,
            selection
                .matched_rule_id
                .as_deref()
                .map(|r| format!(", rule '{r}'"))
                .unwrap_or_default()
        );

        let outcome = self.executor.start(tx, work_item_id, &selection.workflow_id).await?;
        Ok((selection, outcome))
    }

    /// Apply a stage result and dispatch whatever comes next.
    ///
    /// # Errors
    /// Executor errors, after which nothing is committed. Store errors may
    /// be retried with the same `ctx` and `result`.
    #[instrument(skip(self, ctx, result), fields(work_item_id = %ctx.work_item_id))]
    pub async fn advance(
        &self,
        ctx: &ExecutionContext,
        result: StageResult,
    ) -> Result<Step, EngineError> {
        let mut tx = self.store.begin().await?;
        let staged = self.executor.advance(&mut tx, ctx, result).await;
        let outcome = settle(tx, staged).await?;

        let dispatch = self.dispatch(outcome.dispatch.clone()).await;
        Ok(Step { selection: None, outcome, dispatch })
    }

    /// Rebuild the context of an active work item from the store.
    pub async fn context_for(&self, work_item_id: Uuid) -> Result<ExecutionContext, EngineError> {
        let mut tx = self.store.begin().await?;
        let item = tx.get_work_item(work_item_id).await;
        if let Err(err) = tx.rollback().await {
            warn!("read-only transaction rollback failed: {err}");
        }
        let item = item?;

        if item.status != WorkItemStatus::Active {
            return Err(EngineError::WorkItemNotActive { work_item_id, status: item.status });
        }

        let missing = |field: &str| EngineError::StaleContext {
            work_item_id,
            detail: format!("active work item has no {field}"),
        };
        let initial_context: InitialContext = match item.initial_context {
            Some(Value::Object(map)) => map,
            _ => InitialContext::new(),
        };

        Ok(ExecutionContext {
            work_item_id,
            workflow_id: item.workflow_id.ok_or_else(|| missing("workflow"))?,
            current_stage_index: item
                .current_stage_index
                .ok_or_else(|| missing("stage pointer"))? as usize,
            stage_instance_id: item
                .current_stage_instance_id
                .ok_or_else(|| missing("stage instance"))?,
            iteration_count: item.iteration_count,
            loop_iterations: item.loop_iterations,
            initial_context,
        })
    }

    // -----------------------------------------------------------------------
    // Internal: dispatch with retry after commit.
    // -----------------------------------------------------------------------

    async fn dispatch(&self, request: Option<DispatchRequest>) -> DispatchStatus {
        let Some(request) = request else {
            return DispatchStatus::NotRequired;
        };
        let mut attempts = 0u32;

        loop {
            match self.dispatcher.dispatch(request.clone()).await {
                Ok(handle) => {
                    info!(
                        agent_role = %request.agent_role,
                        stage_instance_id = %request.stage_instance_id,
                        "dispatched to session {}",
                        handle
                    );
                    return DispatchStatus::Dispatched(handle);
                }

                Err(DispatchError::Fatal(msg)) => {
                    error!(
                        agent_role = %request.agent_role,
                        "dispatch failed, transition stays committed: {}",
                        msg
                    );
                    return DispatchStatus::Failed(msg);
                }

                Err(DispatchError::Retryable(msg)) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        error!(
                            agent_role = %request.agent_role,
                            "dispatch retries exhausted after {} attempts: {}",
                            attempts,
                            msg
                        );
                        return DispatchStatus::Failed(msg);
                    }

                    let delay = self
                        .config
                        .retry_base_delay()
                        .saturating_mul(2u32.saturating_pow(attempts - 1));

                    warn!(
                        "dispatch to '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        request.agent_role, attempts, self.config.max_retries, delay, msg
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Commit on success; roll back and pass the error through otherwise.
async fn settle<T: StoreTx, R>(tx: T, staged: Result<R, EngineError>) -> Result<R, EngineError> {
    match staged {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("rollback after failed transition also failed: {rollback}");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agents::mock::MockDispatcher;
    use db::{MemoryStore, models::NewWorkItem};

    use super::*;
    use crate::{
        conditions::ConditionRegistry,
        executor::{Action, ExecutorConfig},
        models::{Priority, RuleMatch, SelectionRule, SelectionRuleSet, Stage, WorkflowDefinition},
        selector::SelectionReason,
        validator::{Validator, ValidatorConfig},
    };

    fn orchestrator(dispatcher: MockDispatcher) -> (Orchestrator<MemoryStore, MockDispatcher>, MemoryStore) {
        let conditions = Arc::new(ConditionRegistry::new());
        let definitions = Validator::new(&conditions, ValidatorConfig::default())
            .load(
                vec![
                    WorkflowDefinition::new(
                        "standard",
                        vec![
                            Stage::simple("implement", "developer"),
                            Stage::simple("review", "reviewer").looping("implement", 1),
                        ],
                    ),
                    WorkflowDefinition::new(
                        "fast-track",
                        vec![Stage::simple("patch", "developer").with_veto()],
                    ),
                ],
                SelectionRuleSet {
                    default_workflow_id: "standard".into(),
                    rules: vec![SelectionRule::new(
                        "urgent",
                        "fast-track",
                        RuleMatch { priority: Some(vec![Priority::P0]), ..Default::default() },
                    )],
                },
            )
            .unwrap();

        let executor = WorkflowExecutor::new(Arc::new(definitions), conditions, ExecutorConfig::default());
        let store = MemoryStore::new();
        let config = DispatchConfig { max_retries: 3, retry_base_delay_ms: 0 };
        (Orchestrator::new(store.clone(), dispatcher, executor, config), store)
    }

    async fn pending_item(store: &MemoryStore, priority: Option<&str>) -> Uuid {
        let mut new = NewWorkItem::titled("Add login page");
        new.priority = priority.map(str::to_owned);
        store.insert_work_item(new).await.id
    }

    #[tokio::test]
    async fn start_selects_by_rule_and_dispatches_first_stage() {
        let (orch, store) = orchestrator(MockDispatcher::accepting());
        let id = pending_item(&store, Some("P0")).await;

        let step = orch.start(id, None).await.unwrap();
        let selection = step.selection.unwrap();
        assert_eq!(selection.workflow_id, "fast-track");
        assert_eq!(selection.reason, SelectionReason::Rule);
        assert_eq!(step.outcome.action, Action::Continue);
        assert_eq!(step.dispatch, DispatchStatus::Dispatched(SessionHandle("developer-session-1".into())));
        assert_eq!(store.work_item(id).await.unwrap().status, WorkItemStatus::Active);
    }

    #[tokio::test]
    async fn flaky_dispatch_is_retried() {
        let (orch, store) = orchestrator(MockDispatcher::flaky(2));
        let id = pending_item(&store, None).await;

        let step = orch.start(id, None).await.unwrap();
        assert!(matches!(step.dispatch, DispatchStatus::Dispatched(_)));
        assert_eq!(orch.dispatcher().call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_the_committed_transition() {
        let (orch, store) = orchestrator(MockDispatcher::failing_retryable("pool busy"));
        let id = pending_item(&store, None).await;

        let step = orch.start(id, None).await.unwrap();
        assert_eq!(step.dispatch, DispatchStatus::Failed("pool busy".into()));
        assert_eq!(orch.dispatcher().call_count(), 4);

        let item = store.work_item(id).await.unwrap();
        assert_eq!(item.status, WorkItemStatus::Active);
        assert_eq!(store.stage_instances(id).await.len(), 1);
    }

    #[tokio::test]
    async fn fatal_dispatch_is_not_retried() {
        let (orch, store) = orchestrator(MockDispatcher::failing_fatal("unknown role"));
        let id = pending_item(&store, None).await;

        let step = orch.start(id, None).await.unwrap();
        assert_eq!(step.dispatch, DispatchStatus::Failed("unknown role".into()));
        assert_eq!(orch.dispatcher().call_count(), 1);
        assert_eq!(store.work_item(id).await.unwrap().workflow_id.as_deref(), Some("standard"));
    }

    #[tokio::test]
    async fn escalation_dispatches_nothing() {
        let (orch, store) = orchestrator(MockDispatcher::accepting());
        let id = pending_item(&store, Some("P0")).await;
        orch.start(id, None).await.unwrap();

        let ctx = orch.context_for(id).await.unwrap();
        let step = orch.advance(&ctx, StageResult::vetoed("leaks credentials")).await.unwrap();
        assert_eq!(step.outcome.action, Action::Escalate);
        assert_eq!(step.dispatch, DispatchStatus::NotRequired);
        assert_eq!(orch.dispatcher().call_count(), 1);
        assert_eq!(store.approvals(id).await.len(), 1);
    }

    #[tokio::test]
    async fn context_for_matches_the_returned_context() {
        let (orch, store) = orchestrator(MockDispatcher::accepting());
        let id = pending_item(&store, None).await;

        let step = orch.start(id, Some("standard")).await.unwrap();
        let rebuilt = orch.context_for(id).await.unwrap();
        assert_eq!(Some(rebuilt.clone()), step.outcome.next_context);

        let step = orch.advance(&rebuilt, StageResult::approved()).await.unwrap();
        assert_eq!(step.outcome.next_stage_index, Some(1));
        assert_eq!(orch.dispatcher().roles(), vec!["developer", "reviewer"]);
    }

    #[tokio::test]
    async fn unknown_explicit_workflow_leaves_item_pending() {
        let (orch, store) = orchestrator(MockDispatcher::accepting());
        let id = pending_item(&store, None).await;

        let err = orch.start(id, Some("nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownWorkflow(_)));

        let item = store.work_item(id).await.unwrap();
        assert_eq!(item.status, WorkItemStatus::Pending);
        assert!(store.activity(id).await.is_empty());
        assert_eq!(orch.dispatcher().call_count(), 0);
    }

    #[tokio::test]
    async fn context_for_refuses_shipped_items() {
        let (orch, store) = orchestrator(MockDispatcher::accepting());
        let id = pending_item(&store, Some("P0")).await;
        orch.start(id, None).await.unwrap();

        let ctx = orch.context_for(id).await.unwrap();
        let step = orch.advance(&ctx, StageResult::approved()).await.unwrap();
        assert_eq!(step.outcome.action, Action::Complete);

        assert!(matches!(
            orch.context_for(id).await,
            Err(EngineError::WorkItemNotActive { status: WorkItemStatus::Shipped, .. })
        ));
    }
}
