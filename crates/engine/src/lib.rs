//! `engine` crate: workflow definitions, validation, selection, and the
//! per-work-item execution state machine.

pub mod models;
pub mod error;
pub mod conditions;
pub mod precedence;
pub mod validator;
pub mod selector;
pub mod escalation;
pub mod executor;
pub mod orchestrator;
pub mod config;

pub use config::EngineConfig;
pub use conditions::{BuiltinCondition, ConditionRegistry};
pub use error::{EngineError, ErrorKind};
pub use escalation::{EscalationReason, build_escalation_message};
pub use executor::{Action, AdvanceOutcome, ExecutorConfig, WorkflowExecutor};
pub use models::{
    ExecutionContext, Priority, SelectionRule, SelectionRuleSet, Stage, StageResult, StageStatus,
    WorkflowDefinition,
};
pub use orchestrator::{DispatchConfig, DispatchStatus, Orchestrator, Step};
pub use precedence::order_by_precedence;
pub use selector::{Selection, SelectionInput, SelectionReason, select};
pub use validator::{DefinitionSet, UnknownConditionPolicy, Validator, ValidatorConfig};
