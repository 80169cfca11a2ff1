//! Core domain models for the orchestration engine.
//!
//! Definition types (`WorkflowDefinition`, `Stage`, `SelectionRuleSet`, …)
//! deserialize from the camelCase documents operators write, and reject
//! unknown fields so that a typo never silently becomes a default. Runtime
//! types (`ExecutionContext`, `StageResult`) travel between the executor and
//! its callers.

use std::collections::BTreeMap;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Key/value snapshot of a work item taken when its workflow starts.
pub type InitialContext = Map<String, Value>;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Work item priority, `P0` being the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            "P3" => Ok(Self::P3),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    #[default]
    Simple,
    /// Rejections send the work item back to `loopTarget`.
    Loop,
}

/// One step of a workflow, delegated to a single agent role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Stage {
    /// Unique key within the workflow.
    #[serde(rename = "ref")]
    pub stage_ref: String,
    pub agent_role: String,
    /// Instruction handed to the agent. Defaults to a generic one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Name of a registered condition, evaluated against the initial context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Skip this stage when `condition` evaluates to false.
    #[serde(default)]
    pub optional: bool,
    #[serde(rename = "type", default)]
    pub stage_type: StageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_target: Option<String>,
    /// Rework cycles allowed before escalating. Falls back to the executor's
    /// `default_max_iterations`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub can_veto: bool,
}

impl Stage {
    /// A plain stage with no condition, loop or veto power.
    pub fn simple(stage_ref: impl Into<String>, agent_role: impl Into<String>) -> Self {
        Self {
            stage_ref: stage_ref.into(),
            agent_role: agent_role.into(),
            task: None,
            condition: None,
            optional: false,
            stage_type: StageType::Simple,
            loop_target: None,
            max_iterations: None,
            can_veto: false,
        }
    }

    /// Turn this stage into a loop stage returning to `target` on rejection.
    pub fn looping(mut self, target: impl Into<String>, max_iterations: u32) -> Self {
        self.stage_type = StageType::Loop;
        self.loop_target = Some(target.into());
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Make this stage optional, running only when `condition` holds.
    pub fn optional_when(mut self, condition: impl Into<String>) -> Self {
        self.optional = true;
        self.condition = Some(condition.into());
        self
    }

    pub fn with_veto(mut self) -> Self {
        self.can_veto = true;
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// An ordered list of stages a work item is driven through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<Stage>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            stages,
        }
    }

    /// Position of the stage with the given ref.
    pub fn index_of(&self, stage_ref: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.stage_ref == stage_ref)
    }
}

// ---------------------------------------------------------------------------
// Selection rules
// ---------------------------------------------------------------------------

/// Predicates a work item must satisfy for a rule to fire. An absent (or
/// empty) predicate always matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleMatch {
    /// The work item's priority must be one of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Vec<Priority>>,
    /// At least one of these tags must be on the work item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// At least one keyword must appear in the title (case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_keywords: Option<Vec<String>>,
    /// At least one keyword must appear in the goal (case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_keywords: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectionRule {
    pub id: String,
    pub workflow_id: String,
    #[serde(default, rename = "match")]
    pub predicates: RuleMatch,
    /// Ids of rules this rule must be evaluated before.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub precedes: Vec<String>,
}

impl SelectionRule {
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>, predicates: RuleMatch) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            predicates,
            precedes: Vec::new(),
        }
    }

    pub fn preceding(mut self, rule_ids: &[&str]) -> Self {
        self.precedes = rule_ids.iter().map(|id| id.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectionRuleSet {
    pub default_workflow_id: String,
    #[serde(default)]
    pub rules: Vec<SelectionRule>,
}

/// JSON Schemas of the two definition documents.
pub fn definition_schemas() -> Value {
    serde_json::json!({
        "workflow": schemars::schema_for!(WorkflowDefinition),
        "selectionRuleSet": schemars::schema_for!(SelectionRuleSet),
    })
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Where a work item currently stands in its workflow.
///
/// Superseded (never mutated in place) by the context returned from each
/// successful `advance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub work_item_id: Uuid,
    pub workflow_id: String,
    pub current_stage_index: usize,
    pub stage_instance_id: Uuid,
    /// Iteration of the most recent rework loop.
    pub iteration_count: u32,
    /// Rework cycles consumed per loop stage ref. Never reset while the work
    /// item runs, so every loop stays bounded by its own `maxIterations`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loop_iterations: BTreeMap<String, u32>,
    pub initial_context: InitialContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Approved,
    Rejected,
    Vetoed,
    Completed,
}

impl FromStr for StageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "approved"  => Ok(Self::Approved),
            "rejected"  => Ok(Self::Rejected),
            "vetoed"    => Ok(Self::Vetoed),
            "completed" => Ok(Self::Completed),
            other       => Err(format!("unknown stage status: {other}")),
        }
    }
}

/// What an agent reported back for a stage instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub status: StageStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

impl StageResult {
    pub fn new(status: StageStatus) -> Self {
        Self { status, output: Value::Null, feedback: None, artifacts: Vec::new() }
    }

    pub fn approved() -> Self {
        Self::new(StageStatus::Approved)
    }

    pub fn completed(output: Value) -> Self {
        Self { output, ..Self::new(StageStatus::Completed) }
    }

    pub fn rejected(feedback: impl Into<String>) -> Self {
        Self { feedback: Some(feedback.into()), ..Self::new(StageStatus::Rejected) }
    }

    pub fn vetoed(feedback: impl Into<String>) -> Self {
        Self { feedback: Some(feedback.into()), ..Self::new(StageStatus::Vetoed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_document_uses_camel_case_names() {
        let stage: Stage = serde_json::from_value(json!({
            "ref": "review",
            "agentRole": "reviewer",
            "type": "loop",
            "loopTarget": "implement",
            "maxIterations": 2,
            "canVeto": true
        }))
        .unwrap();

        assert_eq!(stage.stage_ref, "review");
        assert_eq!(stage.stage_type, StageType::Loop);
        assert_eq!(stage.loop_target.as_deref(), Some("implement"));
        assert_eq!(stage.max_iterations, Some(2));
        assert!(stage.can_veto);
        assert!(!stage.optional);
    }

    #[test]
    fn unknown_stage_field_is_rejected() {
        let parsed = serde_json::from_value::<Stage>(json!({
            "ref": "review",
            "agentRole": "reviewer",
            "loop_target": "implement"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn rule_set_parses_match_block() {
        let rules: SelectionRuleSet = serde_json::from_value(json!({
            "defaultWorkflowId": "standard",
            "rules": [{
                "id": "hotfix",
                "workflowId": "fast-track",
                "match": { "priority": ["P0"], "titleKeywords": ["hotfix"] },
                "precedes": ["security"]
            }]
        }))
        .unwrap();

        let rule = &rules.rules[0];
        assert_eq!(rule.predicates.priority, Some(vec![Priority::P0]));
        assert_eq!(rule.precedes, vec!["security"]);
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("p1".parse::<Priority>(), Ok(Priority::P1));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn schemas_cover_both_documents() {
        let schemas = definition_schemas();
        assert!(schemas.get("workflow").is_some());
        assert!(schemas.get("selectionRuleSet").is_some());
    }
}
