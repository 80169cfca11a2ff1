//! Per-work-item state machine.
//!
//! `WorkflowExecutor` turns one stage completion event into the next state of
//! a work item:
//! 1. Checks that the caller's `ExecutionContext` still describes the stored
//!    work item.
//! 2. Records the stage result on the current stage instance.
//! 3. Decides the action (`continue`, `loop`, `escalate`, `complete`).
//! 4. Writes every consequence through the caller's transaction.
//!
//! The executor never commits. The caller owns the transaction and either
//! commits it after `advance` returns `Ok` or drops it, so a failed
//! invocation leaves no trace. Dispatching the next stage happens after the
//! commit, outside this module.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use agents::DispatchRequest;
use db::{
    StoreTx,
    models::{
        NewActivity, NewApproval, NewStageInstance, StageInstanceRecord, StageInstanceStatus,
        WorkItemRecord, WorkItemStatus,
    },
};

use crate::{
    EngineError,
    conditions::ConditionRegistry,
    escalation::{EscalationReason, build_escalation_message},
    models::{ExecutionContext, InitialContext, Stage, StageResult, StageStatus, WorkflowDefinition},
    validator::DefinitionSet,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Rework budget of a loop stage that does not set `maxIterations`.
    pub default_max_iterations: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { default_max_iterations: 3 }
    }
}

// ---------------------------------------------------------------------------
// Outcome of one invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Continue,
    Loop,
    Escalate,
    Complete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Loop     => "loop",
            Self::Escalate => "escalate",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `start` / `advance` decided and wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceOutcome {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stage_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_agent_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stage_instance_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<EscalationReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_message: Option<String>,
    /// Refs of optional stages skipped on the way to the next stage.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    /// Context for the next `advance` call. `None` once the work item is
    /// shipped or blocked.
    #[serde(skip)]
    pub next_context: Option<ExecutionContext>,
    /// Task to hand to an agent once the transaction has committed.
    #[serde(skip)]
    pub dispatch: Option<DispatchRequest>,
}

impl AdvanceOutcome {
    fn terminal(action: Action, skipped: Vec<String>) -> Self {
        Self {
            action,
            next_stage_index: None,
            next_agent_role: None,
            next_stage_instance_id: None,
            escalation_reason: None,
            escalation_message: None,
            skipped,
            next_context: None,
            dispatch: None,
        }
    }
}

/// Decision taken for a stage result, before anything is written.
enum Transition {
    Continue,
    Loop { target_index: usize, iteration: u32 },
    Escalate { reason: EscalationReason, consumed: u32, cap: Option<u32> },
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Stateless between calls: everything it needs comes from the definition
/// set, the caller's context and the store.
#[derive(Debug, Clone)]
pub struct WorkflowExecutor {
    definitions: Arc<DefinitionSet>,
    conditions: Arc<ConditionRegistry>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        definitions: Arc<DefinitionSet>,
        conditions: Arc<ConditionRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self { definitions, conditions, config }
    }

    pub fn definitions(&self) -> &DefinitionSet {
        &self.definitions
    }

    fn workflow(&self, id: &str) -> Result<&WorkflowDefinition, EngineError> {
        self.definitions
            .workflow(id)
            .ok_or_else(|| EngineError::UnknownWorkflow(id.to_owned()))
    }

    /// Enter a pending work item into `workflow_id`.
    ///
    /// Snapshots the initial context, then positions the item on the first
    /// stage that is not skipped. If every stage is skipped the item ships
    /// straight away.
    ///
    /// # Errors
    /// - [`EngineError::AlreadyStarted`] if the item is not pending.
    /// - [`EngineError::UnknownWorkflow`] if `workflow_id` is not loaded.
    /// - [`EngineError::Database`] for store failures.
    #[instrument(skip(self, tx))]
    pub async fn start<T: StoreTx>(
        &self,
        tx: &mut T,
        work_item_id: Uuid,
        workflow_id: &str,
    ) -> Result<AdvanceOutcome, EngineError> {
        let mut item = tx.get_work_item(work_item_id).await?;
        if item.status != WorkItemStatus::Pending || item.workflow_id.is_some() {
            return Err(EngineError::AlreadyStarted(work_item_id));
        }
        let workflow = self.workflow(workflow_id)?;

        let initial_context = snapshot(&item);
        item.workflow_id = Some(workflow.id.clone());
        item.initial_context = Some(Value::Object(initial_context.clone()));
        item.iteration_count = 0;
        item.loop_iterations.clear();

        tx.append_activity(NewActivity::new(
            item.id,
            "workflow.started",
            json!({ "workflowId": workflow.id, "stageCount": workflow.stages.len() }),
        ))
        .await?;
        info!("work item entered workflow '{}'", workflow.id);

        let input = Value::Object(initial_context.clone());
        self.proceed(tx, item, workflow, 0, input, &initial_context).await
    }

    /// Apply one stage result.
    ///
    /// # Errors
    /// - [`EngineError::WorkItemNotActive`] if the item is shipped, blocked
    ///   or never started.
    /// - [`EngineError::StaleContext`] if `ctx` no longer matches the store.
    /// - [`EngineError::StageIndexOutOfRange`] /
    ///   [`EngineError::UnresolvedLoopTarget`] for definitions that bypassed
    ///   validation.
    /// - [`EngineError::Database`] for store failures; retry with the same
    ///   inputs.
    #[instrument(
        skip(self, tx, ctx, result),
        fields(
            work_item_id = %ctx.work_item_id,
            workflow_id = %ctx.workflow_id,
            stage_index = ctx.current_stage_index,
            status = ?result.status,
        )
    )]
    pub async fn advance<T: StoreTx>(
        &self,
        tx: &mut T,
        ctx: &ExecutionContext,
        result: StageResult,
    ) -> Result<AdvanceOutcome, EngineError> {
        let item = tx.get_work_item(ctx.work_item_id).await?;
        check_context(&item, ctx)?;

        let workflow = self.workflow(&ctx.workflow_id)?;
        let stage = workflow.stages.get(ctx.current_stage_index).ok_or_else(|| {
            EngineError::StageIndexOutOfRange {
                workflow_id: workflow.id.clone(),
                index: ctx.current_stage_index,
                len: workflow.stages.len(),
            }
        })?;

        let status = match result.status {
            StageStatus::Vetoed if !stage.can_veto => {
                warn!(stage_ref = %stage.stage_ref, "stage cannot veto; treating the veto as a rejection");
                StageStatus::Rejected
            }
            other => other,
        };

        // -------------------------------------------------------------------
        // Record the result on the current stage instance
        // -------------------------------------------------------------------
        let mut instance = tx.get_stage_instance(ctx.stage_instance_id).await?;
        instance.status = instance_status(status);
        instance.output = Some(result.output.clone());
        instance.feedback = result.feedback.clone();
        instance.artifacts = result.artifacts.clone();

        match self.decide(workflow, stage, &item.loop_iterations, status)? {
            Transition::Escalate { reason, consumed, cap } => {
                let report_ctx = ExecutionContext { iteration_count: consumed, ..ctx.clone() };
                let message = build_escalation_message(
                    &report_ctx,
                    workflow,
                    reason,
                    result.feedback.as_deref(),
                    cap,
                );
                self.escalate(tx, item, instance, stage, reason, message).await
            }
            Transition::Loop { target_index, iteration } => {
                tx.update_stage_instance(&instance).await?;
                self.rework(tx, item, workflow, stage, target_index, iteration, &result, ctx)
                    .await
            }
            Transition::Continue => {
                tx.update_stage_instance(&instance).await?;
                debug!("stage '{}' finished as {:?}", stage.stage_ref, status);
                self.proceed(
                    tx,
                    item,
                    workflow,
                    ctx.current_stage_index + 1,
                    result.output,
                    &ctx.initial_context,
                )
                .await
            }
        }
    }

    fn decide(
        &self,
        workflow: &WorkflowDefinition,
        stage: &Stage,
        loop_iterations: &BTreeMap<String, u32>,
        status: StageStatus,
    ) -> Result<Transition, EngineError> {
        let cap = stage
            .loop_target
            .as_ref()
            .map(|_| stage.max_iterations.unwrap_or(self.config.default_max_iterations));

        // Budget already spent on this stage's own loop.
        let consumed = loop_iterations.get(&stage.stage_ref).copied().unwrap_or(0);

        match status {
            StageStatus::Vetoed => Ok(Transition::Escalate {
                reason: EscalationReason::SecurityVeto,
                consumed,
                cap,
            }),
            StageStatus::Rejected => {
                let (Some(target), Some(cap)) = (&stage.loop_target, cap) else {
                    return Ok(Transition::Continue);
                };
                let target_index = workflow.index_of(target).ok_or_else(|| {
                    EngineError::UnresolvedLoopTarget {
                        workflow_id: workflow.id.clone(),
                        stage_ref: stage.stage_ref.clone(),
                        target: target.clone(),
                    }
                })?;
                if consumed >= cap {
                    return Ok(Transition::Escalate {
                        reason: EscalationReason::IterationCapExceeded,
                        consumed,
                        cap: Some(cap),
                    });
                }
                Ok(Transition::Loop { target_index, iteration: consumed + 1 })
            }
            StageStatus::Approved | StageStatus::Completed => Ok(Transition::Continue),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn escalate<T: StoreTx>(
        &self,
        tx: &mut T,
        mut item: WorkItemRecord,
        mut instance: StageInstanceRecord,
        stage: &Stage,
        reason: EscalationReason,
        message: String,
    ) -> Result<AdvanceOutcome, EngineError> {
        instance.status = StageInstanceStatus::Blocked;
        tx.update_stage_instance(&instance).await?;

        let approval = tx
            .create_approval(NewApproval {
                work_item_id: item.id,
                stage_instance_id: instance.id,
                kind: "escalation".into(),
                reason: reason.as_str().into(),
                message: message.clone(),
            })
            .await?;

        item.status = WorkItemStatus::Blocked;
        item.blocked_reason = Some(reason.as_str().into());
        tx.update_work_item(&item).await?;

        tx.append_activity(NewActivity::new(
            item.id,
            "workflow.escalated",
            json!({
                "reason": reason.as_str(),
                "stage": stage.stage_ref,
                "stageInstanceId": instance.id,
                "approvalId": approval.id,
            }),
        ))
        .await?;

        warn!(stage_ref = %stage.stage_ref, "work item escalated: {}", reason);

        Ok(AdvanceOutcome {
            escalation_reason: Some(reason),
            escalation_message: Some(message),
            ..AdvanceOutcome::terminal(Action::Escalate, Vec::new())
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn rework<T: StoreTx>(
        &self,
        tx: &mut T,
        mut item: WorkItemRecord,
        workflow: &WorkflowDefinition,
        rejecting: &Stage,
        target_index: usize,
        iteration: u32,
        result: &StageResult,
        ctx: &ExecutionContext,
    ) -> Result<AdvanceOutcome, EngineError> {
        let target = &workflow.stages[target_index];
        let label = format!("rework (iteration {iteration})");
        let input = json!({
            "feedback": result.feedback,
            "rejectedBy": rejecting.stage_ref,
            "artifacts": result.artifacts,
            "iteration": iteration,
        });

        let instance = tx
            .create_stage_instance(new_instance(
                &item,
                workflow,
                target,
                target_index,
                iteration,
                Some(label),
                input,
            ))
            .await?;

        item.status = WorkItemStatus::Active;
        item.blocked_reason = None;
        item.current_stage_index = Some(index_u32(target_index));
        item.current_stage_instance_id = Some(instance.id);
        item.iteration_count = iteration;
        item.loop_iterations.insert(rejecting.stage_ref.clone(), iteration);
        tx.update_work_item(&item).await?;

        tx.append_activity(NewActivity::new(
            item.id,
            "workflow.loop",
            json!({
                "fromStage": rejecting.stage_ref,
                "toStage": target.stage_ref,
                "iteration": iteration,
                "feedback": result.feedback,
            }),
        ))
        .await?;

        info!(
            "stage '{}' rejected; back to '{}' (iteration {})",
            rejecting.stage_ref, target.stage_ref, iteration
        );

        Ok(self.running_outcome(
            Action::Loop,
            &item,
            workflow,
            target,
            target_index,
            &instance,
            &ctx.initial_context,
            Vec::new(),
        ))
    }

    /// Move forward from `from`, skipping optional stages whose condition is
    /// false. Ships the item when no stage is left.
    async fn proceed<T: StoreTx>(
        &self,
        tx: &mut T,
        mut item: WorkItemRecord,
        workflow: &WorkflowDefinition,
        from: usize,
        input: Value,
        initial_context: &InitialContext,
    ) -> Result<AdvanceOutcome, EngineError> {
        let mut skipped = Vec::new();
        let mut next = None;

        for (index, stage) in workflow.stages.iter().enumerate().skip(from) {
            if self.should_skip(stage, initial_context) {
                tx.append_activity(NewActivity::new(
                    item.id,
                    "workflow.stage_skipped",
                    json!({ "stage": stage.stage_ref, "condition": stage.condition }),
                ))
                .await?;
                debug!("skipping optional stage '{}'", stage.stage_ref);
                skipped.push(stage.stage_ref.clone());
                continue;
            }
            next = Some((index, stage));
            break;
        }

        let Some((index, stage)) = next else {
            item.status = WorkItemStatus::Shipped;
            item.blocked_reason = None;
            tx.update_work_item(&item).await?;
            tx.append_activity(NewActivity::new(
                item.id,
                "workflow.completed",
                json!({ "workflowId": workflow.id, "iterationCount": item.iteration_count }),
            ))
            .await?;
            info!("workflow '{}' complete; work item shipped", workflow.id);
            return Ok(AdvanceOutcome::terminal(Action::Complete, skipped));
        };

        let instance = tx
            .create_stage_instance(new_instance(
                &item,
                workflow,
                stage,
                index,
                item.iteration_count,
                None,
                input,
            ))
            .await?;

        item.status = WorkItemStatus::Active;
        item.blocked_reason = None;
        item.current_stage_index = Some(index_u32(index));
        item.current_stage_instance_id = Some(instance.id);
        tx.update_work_item(&item).await?;

        tx.append_activity(NewActivity::new(
            item.id,
            "workflow.stage_advanced",
            json!({ "stage": stage.stage_ref, "stageIndex": index, "agentRole": stage.agent_role }),
        ))
        .await?;

        Ok(self.running_outcome(
            Action::Continue,
            &item,
            workflow,
            stage,
            index,
            &instance,
            initial_context,
            skipped,
        ))
    }

    fn should_skip(&self, stage: &Stage, initial_context: &InitialContext) -> bool {
        match (&stage.condition, stage.optional) {
            (Some(condition), true) => !self.conditions.evaluate(condition, initial_context),
            _ => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn running_outcome(
        &self,
        action: Action,
        item: &WorkItemRecord,
        workflow: &WorkflowDefinition,
        stage: &Stage,
        index: usize,
        instance: &StageInstanceRecord,
        initial_context: &InitialContext,
        skipped: Vec<String>,
    ) -> AdvanceOutcome {
        let next_context = ExecutionContext {
            work_item_id: item.id,
            workflow_id: workflow.id.clone(),
            current_stage_index: index,
            stage_instance_id: instance.id,
            iteration_count: item.iteration_count,
            loop_iterations: item.loop_iterations.clone(),
            initial_context: initial_context.clone(),
        };

        let task = stage.task.clone().unwrap_or_else(|| {
            format!("Carry out the '{}' stage of workflow '{}'", stage.stage_ref, workflow.id)
        });
        let dispatch = DispatchRequest {
            agent_role: stage.agent_role.clone(),
            work_item_id: item.id,
            stage_instance_id: instance.id,
            task,
            context: json!({
                "input": instance.input,
                "label": instance.label,
                "initialContext": initial_context,
            }),
        };

        AdvanceOutcome {
            action,
            next_stage_index: Some(index),
            next_agent_role: Some(stage.agent_role.clone()),
            next_stage_instance_id: Some(instance.id),
            escalation_reason: None,
            escalation_message: None,
            skipped,
            next_context: Some(next_context),
            dispatch: Some(dispatch),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Reject calls whose context no longer describes the stored work item.
fn check_context(item: &WorkItemRecord, ctx: &ExecutionContext) -> Result<(), EngineError> {
    if item.status != WorkItemStatus::Active {
        return Err(EngineError::WorkItemNotActive {
            work_item_id: item.id,
            status: item.status,
        });
    }

    let stale = |detail: String| EngineError::StaleContext { work_item_id: item.id, detail };

    if item.workflow_id.as_deref() != Some(ctx.workflow_id.as_str()) {
        return Err(stale(format!(
            "context names workflow '{}', stored item is in {:?}",
            ctx.workflow_id, item.workflow_id
        )));
    }
    if item.current_stage_index.map(|i| i as usize) != Some(ctx.current_stage_index) {
        return Err(stale(format!(
            "context is at stage {}, stored item is at {:?}",
            ctx.current_stage_index, item.current_stage_index
        )));
    }
    if item.current_stage_instance_id != Some(ctx.stage_instance_id) {
        return Err(stale(format!(
            "stage instance {} is no longer current",
            ctx.stage_instance_id
        )));
    }
    if item.iteration_count != ctx.iteration_count {
        return Err(stale(format!(
            "context iteration {} differs from stored {}",
            ctx.iteration_count, item.iteration_count
        )));
    }
    if item.loop_iterations != ctx.loop_iterations {
        return Err(stale(format!(
            "context loop budgets {:?} differ from stored {:?}",
            ctx.loop_iterations, item.loop_iterations
        )));
    }
    Ok(())
}

/// Key/value snapshot used to evaluate stage conditions for the rest of the
/// workflow. Work item fields win over metadata keys of the same name.
fn snapshot(item: &WorkItemRecord) -> InitialContext {
    let mut ctx = match &item.metadata {
        Value::Object(map) => map.clone(),
        _ => InitialContext::new(),
    };
    ctx.insert("title".into(), Value::String(item.title.clone()));
    if let Some(goal) = &item.goal {
        ctx.insert("goal".into(), Value::String(goal.clone()));
    }
    if let Some(priority) = &item.priority {
        ctx.insert("priority".into(), Value::String(priority.clone()));
    }
    ctx.insert("tags".into(), json!(item.tags));
    ctx
}

fn instance_status(status: StageStatus) -> StageInstanceStatus {
    match status {
        StageStatus::Approved  => StageInstanceStatus::Approved,
        StageStatus::Rejected  => StageInstanceStatus::Rejected,
        StageStatus::Vetoed    => StageInstanceStatus::Vetoed,
        StageStatus::Completed => StageInstanceStatus::Completed,
    }
}

fn new_instance(
    item: &WorkItemRecord,
    workflow: &WorkflowDefinition,
    stage: &Stage,
    index: usize,
    iteration: u32,
    label: Option<String>,
    input: Value,
) -> NewStageInstance {
    NewStageInstance {
        work_item_id: item.id,
        workflow_id: workflow.id.clone(),
        stage_ref: stage.stage_ref.clone(),
        stage_index: index_u32(index),
        agent_role: stage.agent_role.clone(),
        iteration,
        label,
        input,
    }
}

fn index_u32(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}
