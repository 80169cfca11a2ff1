//! Engine-level error types.

use std::path::PathBuf;

use db::models::WorkItemStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the orchestration engine (validation, selection,
/// execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// A field failed a structural check (empty id, zero cap, …).
    #[error("{location}: {problem}")]
    InvalidDefinition { location: String, problem: String },

    #[error("duplicate workflow id '{0}'")]
    DuplicateWorkflowId(String),

    #[error("workflow '{workflow_id}': duplicate stage ref '{stage_ref}'")]
    DuplicateStageRef { workflow_id: String, stage_ref: String },

    /// `type: loop` without a loop target, or loop settings on a simple stage.
    #[error("workflow '{workflow_id}', stage '{stage_ref}': {problem}")]
    LoopConfigMismatch {
        workflow_id: String,
        stage_ref: String,
        problem: &'static str,
    },

    #[error("workflow '{workflow_id}', stage '{stage_ref}': loopTarget '{target}' is not a stage of this workflow")]
    UnknownLoopTarget {
        workflow_id: String,
        stage_ref: String,
        target: String,
    },

    #[error("workflow '{workflow_id}', stage '{stage_ref}': unknown condition '{condition}'")]
    UnknownCondition {
        workflow_id: String,
        stage_ref: String,
        condition: String,
    },

    #[error("duplicate selection rule id '{0}'")]
    DuplicateRuleId(String),

    #[error("selection rule '{rule_id}': workflowId '{workflow_id}' is not a known workflow")]
    UnknownRuleWorkflow { rule_id: String, workflow_id: String },

    #[error("defaultWorkflowId '{0}' is not a known workflow")]
    UnknownDefaultWorkflow(String),

    #[error("selection rule '{rule_id}': precedes unknown rule '{target}'")]
    UnknownPrecedenceTarget { rule_id: String, target: String },

    #[error("selection rule '{0}' cannot precede itself")]
    SelfPrecedence(String),

    /// Every rule id left unordered by the topological sort.
    #[error("selection rule precedence has a cycle among: {}", .0.join(", "))]
    PrecedenceCycle(Vec<String>),

    // ------ Selection errors ------

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    // ------ Execution errors ------

    #[error("workflow '{workflow_id}' has no stage at index {index} ({len} stages)")]
    StageIndexOutOfRange {
        workflow_id: String,
        index: usize,
        len: usize,
    },

    #[error("workflow '{workflow_id}', stage '{stage_ref}': loop target '{target}' cannot be resolved")]
    UnresolvedLoopTarget {
        workflow_id: String,
        stage_ref: String,
        target: String,
    },

    #[error("work item {work_item_id} is {status} and cannot be advanced")]
    WorkItemNotActive {
        work_item_id: Uuid,
        status: WorkItemStatus,
    },

    #[error("work item {0} has already entered orchestration")]
    AlreadyStarted(Uuid),

    /// The caller's context no longer matches the stored work item.
    #[error("stale execution context for work item {work_item_id}: {detail}")]
    StaleContext { work_item_id: Uuid, detail: String },

    // ------ Configuration errors ------

    #[error("cannot read config '{}': {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}

/// Broad classes of [`EngineError`], telling the caller what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The definition set is unusable until fixed.
    Validation,
    /// Bad client input; pick another workflow id.
    Selection,
    /// A bug or a definition that bypassed validation. Do not retry.
    Programmer,
    /// The store failed; retry the whole call with the same inputs.
    Store,
    Config,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDefinition { .. }
            | Self::DuplicateWorkflowId(_)
            | Self::DuplicateStageRef { .. }
            | Self::LoopConfigMismatch { .. }
            | Self::UnknownLoopTarget { .. }
            | Self::UnknownCondition { .. }
            | Self::DuplicateRuleId(_)
            | Self::UnknownRuleWorkflow { .. }
            | Self::UnknownDefaultWorkflow(_)
            | Self::UnknownPrecedenceTarget { .. }
            | Self::SelfPrecedence(_)
            | Self::PrecedenceCycle(_) => ErrorKind::Validation,

            Self::UnknownWorkflow(_) => ErrorKind::Selection,

            Self::StageIndexOutOfRange { .. }
            | Self::UnresolvedLoopTarget { .. }
            | Self::WorkItemNotActive { .. }
            | Self::AlreadyStarted(_)
            | Self::StaleContext { .. } => ErrorKind::Programmer,

            Self::ConfigRead { .. } | Self::ConfigParse(_) => ErrorKind::Config,

            Self::Database(_) => ErrorKind::Store,
        }
    }
}
