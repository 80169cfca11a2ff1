//! Human-readable escalation reports.

use serde::{Deserialize, Serialize};

use crate::models::{ExecutionContext, WorkflowDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// A stage with veto power vetoed the result.
    SecurityVeto,
    /// A rejection arrived after the loop's rework budget was spent.
    IterationCapExceeded,
}

impl EscalationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SecurityVeto         => "security_veto",
            Self::IterationCapExceeded => "iteration_cap_exceeded",
        }
    }

    fn headline(self) -> &'static str {
        match self {
            Self::SecurityVeto         => "Security veto",
            Self::IterationCapExceeded => "Rework limit reached",
        }
    }
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render the report attached to an escalation approval.
///
/// `iteration_cap` is the loop budget of the escalating stage, if it has one.
pub fn build_escalation_message(
    ctx: &ExecutionContext,
    workflow: &WorkflowDefinition,
    reason: EscalationReason,
    feedback: Option<&str>,
    iteration_cap: Option<u32>,
) -> String {
    let stage = workflow.stages.get(ctx.current_stage_index);
    let stage_ref = stage.map_or("<unknown>", |s| s.stage_ref.as_str());
    let agent_role = stage.map_or("<unknown>", |s| s.agent_role.as_str());

    let iterations = match iteration_cap {
        Some(cap) => format!("{} / {cap}", ctx.iteration_count),
        None => ctx.iteration_count.to_string(),
    };
    let feedback = match feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(text) => text.lines().map(|line| format!("  {line}")).collect::<Vec<_>>().join("\n"),
        None => "  (none provided)".to_owned(),
    };

    format!(
        "ESCALATION: {headline} ({reason})\n\
         \n\
         Work item:  {work_item}\n\
         Workflow:   {workflow} (stage {position} of {len}: {stage_ref})\n\
         Agent role: {agent_role}\n\
         Iterations: {iterations}\n\
         \n\
         Feedback:\n\
         {feedback}\n\
         \n\
         Actions:\n\
         \x20 1. approve-override  accept the result and continue the workflow\n\
         \x20 2. reject            stop work on this item\n\
         \x20 3. modify            change the work item or workflow and resume",
        headline = reason.headline(),
        reason = reason.as_str(),
        work_item = ctx.work_item_id,
        workflow = workflow.id,
        position = ctx.current_stage_index + 1,
        len = workflow.stages.len(),
    )
}
