//! Definition validation. Run this before trusting any workflow or rule set.
//!
//! Structural shape is enforced by typed deserialization of the definition
//! documents; the checks here cover what serde cannot see: empty names,
//! duplicate keys, dangling references, loop configuration and condition
//! names. A set that fails any check is refused as a whole.
//!
//! [`Validator::load`] is the only way to build a [`DefinitionSet`], the
//! verified value handed to the selector and executor.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    EngineError,
    conditions::ConditionRegistry,
    models::{SelectionRule, SelectionRuleSet, Stage, StageType, WorkflowDefinition},
    precedence::order_by_precedence,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do with a stage condition the registry does not know.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownConditionPolicy {
    /// Refuse the definition.
    #[default]
    Reject,
    /// Accept it; the condition evaluates to true at runtime.
    Allow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorConfig {
    pub unknown_conditions: UnknownConditionPolicy,
}

// ---------------------------------------------------------------------------
// DefinitionSet
// ---------------------------------------------------------------------------

/// A validated set of workflows plus the rule set that selects among them,
/// with rules already in precedence order.
#[derive(Debug, Clone)]
pub struct DefinitionSet {
    workflows: BTreeMap<String, WorkflowDefinition>,
    rule_set: SelectionRuleSet,
}

impl DefinitionSet {
    pub fn workflow(&self, id: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(id)
    }

    pub fn contains_workflow(&self, id: &str) -> bool {
        self.workflows.contains_key(id)
    }

    pub fn workflow_ids(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    /// The rule set with `rules` in evaluation order.
    pub fn rule_set(&self) -> &SelectionRuleSet {
        &self.rule_set
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct Validator<'a> {
    conditions: &'a ConditionRegistry,
    config: ValidatorConfig,
}

impl<'a> Validator<'a> {
    pub fn new(conditions: &'a ConditionRegistry, config: ValidatorConfig) -> Self {
        Self { conditions, config }
    }

    /// Validate one workflow definition.
    ///
    /// # Errors
    /// - [`EngineError::InvalidDefinition`] for empty ids/roles, an empty
    ///   stage list, or `maxIterations: 0`.
    /// - [`EngineError::DuplicateStageRef`] on the first repeated stage ref.
    /// - [`EngineError::LoopConfigMismatch`] / [`EngineError::UnknownLoopTarget`].
    /// - [`EngineError::UnknownCondition`] under [`UnknownConditionPolicy::Reject`].
    pub fn validate(&self, workflow: &WorkflowDefinition) -> Result<(), EngineError> {
        if workflow.id.trim().is_empty() {
            return Err(invalid("workflow", "id", "must not be empty"));
        }
        if workflow.stages.is_empty() {
            return Err(invalid(
                &format!("workflow '{}'", workflow.id),
                "stages",
                "must contain at least one stage",
            ));
        }

        // -------------------------------------------------------------------
        // 1. Stage refs are present and unique
        // -------------------------------------------------------------------
        let mut refs: HashSet<&str> = HashSet::with_capacity(workflow.stages.len());
        for (i, stage) in workflow.stages.iter().enumerate() {
            let location = format!("workflow '{}' stages[{i}]", workflow.id);
            if stage.stage_ref.trim().is_empty() {
                return Err(invalid(&location, "ref", "must not be empty"));
            }
            if stage.agent_role.trim().is_empty() {
                return Err(invalid(&location, "agentRole", "must not be empty"));
            }
            if !refs.insert(stage.stage_ref.as_str()) {
                return Err(EngineError::DuplicateStageRef {
                    workflow_id: workflow.id.clone(),
                    stage_ref: stage.stage_ref.clone(),
                });
            }
        }

        // -------------------------------------------------------------------
        // 2. Per-stage loop + condition checks
        // -------------------------------------------------------------------
        for stage in &workflow.stages {
            self.check_loop(workflow, stage, &refs)?;
            self.check_condition(workflow, stage)?;
        }

        Ok(())
    }

    fn check_loop(
        &self,
        workflow: &WorkflowDefinition,
        stage: &Stage,
        refs: &HashSet<&str>,
    ) -> Result<(), EngineError> {
        let mismatch = |problem| EngineError::LoopConfigMismatch {
            workflow_id: workflow.id.clone(),
            stage_ref: stage.stage_ref.clone(),
            problem,
        };

        match (stage.stage_type, &stage.loop_target) {
            (StageType::Loop, None) => {
                return Err(mismatch("type is 'loop' but no loopTarget is set"));
            }
            (StageType::Simple, Some(_)) => {
                return Err(mismatch("loopTarget is set but type is not 'loop'"));
            }
            (StageType::Simple, None) if stage.max_iterations.is_some() => {
                return Err(mismatch("maxIterations is set without a loopTarget"));
            }
            _ => {}
        }

        if let Some(target) = &stage.loop_target {
            if !refs.contains(target.as_str()) {
                return Err(EngineError::UnknownLoopTarget {
                    workflow_id: workflow.id.clone(),
                    stage_ref: stage.stage_ref.clone(),
                    target: target.clone(),
                });
            }
        }

        if stage.max_iterations == Some(0) {
            return Err(invalid(
                &format!("workflow '{}' stage '{}'", workflow.id, stage.stage_ref),
                "maxIterations",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    fn check_condition(&self, workflow: &WorkflowDefinition, stage: &Stage) -> Result<(), EngineError> {
        let Some(condition) = &stage.condition else {
            return Ok(());
        };

        if !stage.optional {
            warn!(
                workflow_id = %workflow.id,
                stage_ref = %stage.stage_ref,
                "condition '{}' has no effect on a non-optional stage",
                condition
            );
        }

        if self.conditions.contains(condition) {
            return Ok(());
        }

        match self.config.unknown_conditions {
            UnknownConditionPolicy::Reject => Err(EngineError::UnknownCondition {
                workflow_id: workflow.id.clone(),
                stage_ref: stage.stage_ref.clone(),
                condition: condition.clone(),
            }),
            UnknownConditionPolicy::Allow => {
                warn!(
                    workflow_id = %workflow.id,
                    stage_ref = %stage.stage_ref,
                    "unknown condition '{}' accepted; it will evaluate to true",
                    condition
                );
                Ok(())
            }
        }
    }

    /// Validate a rule set against the ids of the workflows it may select.
    ///
    /// # Errors
    /// - [`EngineError::UnknownDefaultWorkflow`] / [`EngineError::UnknownRuleWorkflow`].
    /// - [`EngineError::DuplicateRuleId`] on the first repeated rule id.
    /// - Any precedence error from [`order_by_precedence`].
    pub fn validate_rule_set(
        &self,
        rule_set: &SelectionRuleSet,
        known_workflow_ids: &HashSet<&str>,
    ) -> Result<(), EngineError> {
        ordered_rules(rule_set, known_workflow_ids).map(|_| ())
    }

    /// Validate everything and produce the verified [`DefinitionSet`].
    pub fn load(
        &self,
        workflows: Vec<WorkflowDefinition>,
        rule_set: SelectionRuleSet,
    ) -> Result<DefinitionSet, EngineError> {
        let mut by_id: BTreeMap<String, WorkflowDefinition> = BTreeMap::new();
        for workflow in workflows {
            self.validate(&workflow)?;
            if by_id.contains_key(&workflow.id) {
                return Err(EngineError::DuplicateWorkflowId(workflow.id));
            }
            by_id.insert(workflow.id.clone(), workflow);
        }

        let known: HashSet<&str> = by_id.keys().map(String::as_str).collect();
        let rules = ordered_rules(&rule_set, &known)?;

        info!(
            "definitions validated: {} workflows, rule order: {:?}",
            by_id.len(),
            rules.iter().map(|r| r.id.as_str()).collect::<Vec<_>>()
        );

        Ok(DefinitionSet {
            workflows: by_id,
            rule_set: SelectionRuleSet {
                default_workflow_id: rule_set.default_workflow_id,
                rules,
            },
        })
    }
}

fn ordered_rules(
    rule_set: &SelectionRuleSet,
    known_workflow_ids: &HashSet<&str>,
) -> Result<Vec<SelectionRule>, EngineError> {
    if !known_workflow_ids.contains(rule_set.default_workflow_id.as_str()) {
        return Err(EngineError::UnknownDefaultWorkflow(rule_set.default_workflow_id.clone()));
    }

    let mut seen: HashSet<&str> = HashSet::with_capacity(rule_set.rules.len());
    for (i, rule) in rule_set.rules.iter().enumerate() {
        if rule.id.trim().is_empty() {
            return Err(invalid(&format!("rules[{i}]"), "id", "must not be empty"));
        }
        if !seen.insert(rule.id.as_str()) {
            return Err(EngineError::DuplicateRuleId(rule.id.clone()));
        }
        if !known_workflow_ids.contains(rule.workflow_id.as_str()) {
            return Err(EngineError::UnknownRuleWorkflow {
                rule_id: rule.id.clone(),
                workflow_id: rule.workflow_id.clone(),
            });
        }
    }

    order_by_precedence(&rule_set.rules)
}

fn invalid(location: &str, field: &str, problem: &str) -> EngineError {
    EngineError::InvalidDefinition {
        location: format!("{location}.{field}"),
        problem: problem.to_owned(),
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, RuleMatch};

    fn registry() -> ConditionRegistry {
        ConditionRegistry::new()
    }

    fn strict(registry: &ConditionRegistry) -> Validator<'_> {
        Validator::new(registry, ValidatorConfig::default())
    }

    fn delivery() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "delivery",
            vec![
                Stage::simple("plan", "planner"),
                Stage::simple("implement", "developer"),
                Stage::simple("review", "reviewer").looping("implement", 2),
                Stage::simple("docs", "writer").optional_when("needs_documentation"),
            ],
        )
    }

    fn rule(id: &str, workflow: &str) -> SelectionRule {
        SelectionRule::new(id, workflow, RuleMatch::default())
    }

    #[test]
    fn well_formed_workflow_passes() {
        let registry = registry();
        assert!(strict(&registry).validate(&delivery()).is_ok());
    }

    #[test]
    fn loop_target_may_point_forward() {
        let registry = registry();
        let wf = WorkflowDefinition::new(
            "forward",
            vec![
                Stage::simple("draft", "writer").looping("polish", 1),
                Stage::simple("polish", "editor"),
            ],
        );
        assert!(strict(&registry).validate(&wf).is_ok());
    }

    #[test]
    fn first_duplicate_stage_ref_is_named() {
        let registry = registry();
        let wf = WorkflowDefinition::new(
            "dup",
            vec![
                Stage::simple("a", "x"),
                Stage::simple("b", "x"),
                Stage::simple("a", "y"),
                Stage::simple("b", "y"),
            ],
        );
        match strict(&registry).validate(&wf) {
            Err(EngineError::DuplicateStageRef { workflow_id, stage_ref }) => {
                assert_eq!(workflow_id, "dup");
                assert_eq!(stage_ref, "a");
            }
            other => panic!("expected duplicate stage ref, got {other:?}"),
        }
    }

    #[test]
    fn missing_loop_target_is_a_hard_failure() {
        let registry = registry();
        let wf = WorkflowDefinition::new(
            "broken",
            vec![Stage::simple("review", "reviewer").looping("ghost", 2)],
        );
        assert!(matches!(
            strict(&registry).validate(&wf),
            Err(EngineError::UnknownLoopTarget { target, .. }) if target == "ghost"
        ));
    }

    #[test]
    fn loop_type_without_target_is_rejected() {
        let registry = registry();
        let mut stage = Stage::simple("review", "reviewer");
        stage.stage_type = StageType::Loop;
        let wf = WorkflowDefinition::new("wf", vec![stage]);
        assert!(matches!(
            strict(&registry).validate(&wf),
            Err(EngineError::LoopConfigMismatch { .. })
        ));
    }

    #[test]
    fn loop_target_on_simple_stage_is_rejected() {
        let registry = registry();
        let mut stage = Stage::simple("review", "reviewer");
        stage.loop_target = Some("review".into());
        let wf = WorkflowDefinition::new("wf", vec![stage]);
        assert!(matches!(
            strict(&registry).validate(&wf),
            Err(EngineError::LoopConfigMismatch { .. })
        ));
    }

    #[test]
    fn zero_iteration_cap_is_rejected() {
        let registry = registry();
        let wf = WorkflowDefinition::new(
            "wf",
            vec![Stage::simple("a", "x"), Stage::simple("b", "y").looping("a", 0)],
        );
        match strict(&registry).validate(&wf) {
            Err(EngineError::InvalidDefinition { location, .. }) => {
                assert_eq!(location, "workflow 'wf' stage 'b'.maxIterations")
            }
            other => panic!("expected invalid definition, got {other:?}"),
        }
    }

    #[test]
    fn empty_agent_role_names_the_field() {
        let registry = registry();
        let wf = WorkflowDefinition::new("wf", vec![Stage::simple("a", " ")]);
        match strict(&registry).validate(&wf) {
            Err(EngineError::InvalidDefinition { location, .. }) => {
                assert_eq!(location, "workflow 'wf' stages[0].agentRole")
            }
            other => panic!("expected invalid definition, got {other:?}"),
        }
    }

    #[test]
    fn unknown_condition_is_rejected_by_default() {
        let registry = registry();
        let wf = WorkflowDefinition::new(
            "wf",
            vec![Stage::simple("a", "x").optional_when("is_friday")],
        );
        assert!(matches!(
            strict(&registry).validate(&wf),
            Err(EngineError::UnknownCondition { condition, .. }) if condition == "is_friday"
        ));
    }

    #[test]
    fn unknown_condition_can_be_allowed() {
        let registry = registry();
        let validator = Validator::new(
            &registry,
            ValidatorConfig { unknown_conditions: UnknownConditionPolicy::Allow },
        );
        let wf = WorkflowDefinition::new(
            "wf",
            vec![Stage::simple("a", "x").optional_when("is_friday")],
        );
        assert!(validator.validate(&wf).is_ok());
    }

    #[test]
    fn registered_condition_is_accepted() {
        let mut registry = registry();
        registry.register("is_friday", |_| false);
        let wf = WorkflowDefinition::new(
            "wf",
            vec![Stage::simple("a", "x").optional_when("is_friday")],
        );
        assert!(strict(&registry).validate(&wf).is_ok());
    }

    #[test]
    fn rule_referencing_unknown_workflow_is_rejected() {
        let registry = registry();
        let known: HashSet<&str> = ["delivery"].into_iter().collect();
        let rules = SelectionRuleSet {
            default_workflow_id: "delivery".into(),
            rules: vec![rule("r1", "delivery"), rule("r2", "nope")],
        };
        assert!(matches!(
            strict(&registry).validate_rule_set(&rules, &known),
            Err(EngineError::UnknownRuleWorkflow { rule_id, .. }) if rule_id == "r2"
        ));
    }

    #[test]
    fn unknown_default_workflow_is_rejected() {
        let registry = registry();
        let known: HashSet<&str> = ["delivery"].into_iter().collect();
        let rules = SelectionRuleSet { default_workflow_id: "nope".into(), rules: vec![] };
        assert!(matches!(
            strict(&registry).validate_rule_set(&rules, &known),
            Err(EngineError::UnknownDefaultWorkflow(id)) if id == "nope"
        ));
    }

    #[test]
    fn duplicate_rule_id_is_rejected() {
        let registry = registry();
        let known: HashSet<&str> = ["delivery"].into_iter().collect();
        let rules = SelectionRuleSet {
            default_workflow_id: "delivery".into(),
            rules: vec![rule("r1", "delivery"), rule("r1", "delivery")],
        };
        assert!(matches!(
            strict(&registry).validate_rule_set(&rules, &known),
            Err(EngineError::DuplicateRuleId(id)) if id == "r1"
        ));
    }

    #[test]
    fn load_orders_rules_by_precedence() {
        let registry = registry();
        let urgent = SelectionRule::new(
            "urgent",
            "delivery",
            RuleMatch { priority: Some(vec![Priority::P0]), ..Default::default() },
        );
        let rules = SelectionRuleSet {
            default_workflow_id: "delivery".into(),
            rules: vec![urgent, rule("security", "delivery").preceding(&["urgent"])],
        };

        let set = strict(&registry).load(vec![delivery()], rules).unwrap();
        let order: Vec<&str> = set.rule_set().rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["security", "urgent"]);
        assert!(set.contains_workflow("delivery"));
    }

    #[test]
    fn load_refuses_duplicate_workflow_ids() {
        let registry = registry();
        let rules = SelectionRuleSet { default_workflow_id: "delivery".into(), rules: vec![] };
        assert!(matches!(
            strict(&registry).load(vec![delivery(), delivery()], rules),
            Err(EngineError::DuplicateWorkflowId(id)) if id == "delivery"
        ));
    }

    #[test]
    fn load_refuses_cyclic_precedence() {
        let registry = registry();
        let rules = SelectionRuleSet {
            default_workflow_id: "delivery".into(),
            rules: vec![
                rule("a", "delivery").preceding(&["b"]),
                rule("b", "delivery").preceding(&["a"]),
            ],
        };
        assert!(matches!(
            strict(&registry).load(vec![delivery()], rules),
            Err(EngineError::PrecedenceCycle(ids)) if ids == vec!["a", "b"]
        ));
    }
}
