//! Records that map 1-to-1 onto the orchestration tables.
//!
//! These are *persistence* models; they carry no orchestration behaviour.
//! Workflow definitions and the state machine live in the `engine` crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// work_items
// ---------------------------------------------------------------------------

/// Lifecycle of a work item as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Not yet entered orchestration.
    Pending,
    /// A stage is in flight.
    Active,
    /// Waiting on a human decision (escalated).
    Blocked,
    /// Every stage finished. Terminal.
    Shipped,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Shipped => "shipped",
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active"  => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            "shipped" => Ok(Self::Shipped),
            other     => Err(format!("unknown work item status: {other}")),
        }
    }
}

/// A work item row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemRecord {
    pub id: Uuid,
    pub title: String,
    pub goal: Option<String>,
    /// Raw priority label (`P0`..`P3`); parsed by the engine.
    pub priority: Option<String>,
    pub tags: Vec<String>,
    /// Free-form attributes supplied by whoever created the item.
    pub metadata: Value,
    pub status: WorkItemStatus,
    pub workflow_id: Option<String>,
    pub current_stage_index: Option<u32>,
    pub current_stage_instance_id: Option<Uuid>,
    pub iteration_count: u32,
    /// Rework cycles consumed so far, per loop stage ref.
    pub loop_iterations: BTreeMap<String, u32>,
    pub blocked_reason: Option<String>,
    /// Snapshot taken when the workflow started.
    pub initial_context: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to register a new work item.
#[derive(Debug, Clone, Default)]
pub struct NewWorkItem {
    pub title: String,
    pub goal: Option<String>,
    pub priority: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Value,
}

impl NewWorkItem {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            metadata: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn into_record(self) -> WorkItemRecord {
        let now = Utc::now();
        WorkItemRecord {
            id: Uuid::new_v4(),
            title: self.title,
            goal: self.goal,
            priority: self.priority,
            tags: self.tags,
            metadata: self.metadata,
            status: WorkItemStatus::Pending,
            workflow_id: None,
            current_stage_index: None,
            current_stage_instance_id: None,
            iteration_count: 0,
            loop_iterations: BTreeMap::new(),
            blocked_reason: None,
            initial_context: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// stage_instances
// ---------------------------------------------------------------------------

/// Status of one concrete stage occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageInstanceStatus {
    InProgress,
    Approved,
    Rejected,
    Vetoed,
    Completed,
    Blocked,
}

impl StageInstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Approved   => "approved",
            Self::Rejected   => "rejected",
            Self::Vetoed     => "vetoed",
            Self::Completed  => "completed",
            Self::Blocked    => "blocked",
        }
    }
}

impl std::fmt::Display for StageInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageInstanceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "approved"    => Ok(Self::Approved),
            "rejected"    => Ok(Self::Rejected),
            "vetoed"      => Ok(Self::Vetoed),
            "completed"   => Ok(Self::Completed),
            "blocked"     => Ok(Self::Blocked),
            other         => Err(format!("unknown stage instance status: {other}")),
        }
    }
}

/// A stage instance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInstanceRecord {
    pub id: Uuid,
    pub work_item_id: Uuid,
    pub workflow_id: String,
    pub stage_ref: String,
    pub stage_index: u32,
    pub agent_role: String,
    pub status: StageInstanceStatus,
    pub iteration: u32,
    /// e.g. `rework (iteration 2)`.
    pub label: Option<String>,
    pub input: Value,
    pub output: Option<Value>,
    pub feedback: Option<String>,
    pub artifacts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStageInstance {
    pub work_item_id: Uuid,
    pub workflow_id: String,
    pub stage_ref: String,
    pub stage_index: u32,
    pub agent_role: String,
    pub iteration: u32,
    pub label: Option<String>,
    pub input: Value,
}

impl NewStageInstance {
    pub fn into_record(self) -> StageInstanceRecord {
        let now = Utc::now();
        StageInstanceRecord {
            id: Uuid::new_v4(),
            work_item_id: self.work_item_id,
            workflow_id: self.workflow_id,
            stage_ref: self.stage_ref,
            stage_index: self.stage_index,
            agent_role: self.agent_role,
            status: StageInstanceStatus::InProgress,
            iteration: self.iteration,
            label: self.label,
            input: self.input,
            output: None,
            feedback: None,
            artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// approvals
// ---------------------------------------------------------------------------

/// Resolution state of an approval request. Only `Pending` is written by the
/// engine; the other states are set by whoever answers the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending  => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"  => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other      => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// An approval / escalation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub work_item_id: Uuid,
    pub stage_instance_id: Uuid,
    /// `escalation` for everything the engine creates.
    pub kind: String,
    /// `security_veto` or `iteration_cap_exceeded`.
    pub reason: String,
    pub status: ApprovalStatus,
    /// Human-readable report shown to the approver.
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApproval {
    pub work_item_id: Uuid,
    pub stage_instance_id: Uuid,
    pub kind: String,
    pub reason: String,
    pub message: String,
}

impl NewApproval {
    pub fn into_record(self) -> ApprovalRecord {
        ApprovalRecord {
            id: Uuid::new_v4(),
            work_item_id: self.work_item_id,
            stage_instance_id: self.stage_instance_id,
            kind: self.kind,
            reason: self.reason,
            status: ApprovalStatus::Pending,
            message: self.message,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// activity_log
// ---------------------------------------------------------------------------

/// An append-only activity log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub work_item_id: Uuid,
    /// Dotted action name, e.g. `workflow.loop`.
    pub action: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub work_item_id: Uuid,
    pub action: String,
    pub details: Value,
}

impl NewActivity {
    pub fn new(work_item_id: Uuid, action: impl Into<String>, details: Value) -> Self {
        Self { work_item_id, action: action.into(), details }
    }

    pub fn into_record(self) -> ActivityRecord {
        ActivityRecord {
            id: Uuid::new_v4(),
            work_item_id: self.work_item_id,
            action: self.action,
            details: self.details,
            created_at: Utc::now(),
        }
    }
}
