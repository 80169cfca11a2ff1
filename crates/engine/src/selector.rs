//! Workflow selection for a work item.
//!
//! Pure and synchronous: given the work item's attributes and a validated
//! [`DefinitionSet`], decide which workflow applies and why. An explicit
//! request wins, then the first matching rule (in precedence order), then
//! the rule set's default.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use db::models::WorkItemRecord;

use crate::{
    EngineError,
    models::{Priority, RuleMatch},
    validator::DefinitionSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    Explicit,
    Rule,
    Default,
}

impl SelectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Rule     => "rule",
            Self::Default  => "default",
        }
    }
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The work item attributes rules can look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionInput {
    pub requested_workflow_id: Option<String>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub title: String,
    pub goal: String,
}

impl SelectionInput {
    /// Build the input from a stored work item. An unparseable priority is
    /// treated as absent.
    pub fn from_work_item(item: &WorkItemRecord) -> Self {
        let priority = item.priority.as_deref().and_then(|raw| match raw.parse() {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(work_item_id = %item.id, "ignoring priority: {e}");
                None
            }
        });

        Self {
            requested_workflow_id: None,
            priority,
            tags: item.tags.clone(),
            title: item.title.clone(),
            goal: item.goal.clone().unwrap_or_default(),
        }
    }

    pub fn requesting(mut self, workflow_id: impl Into<String>) -> Self {
        self.requested_workflow_id = Some(workflow_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub workflow_id: String,
    pub reason: SelectionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,
}

/// Choose the workflow for `input`.
///
/// # Errors
/// [`EngineError::UnknownWorkflow`] when an explicitly requested id is not in
/// the definition set.
pub fn select(input: &SelectionInput, definitions: &DefinitionSet) -> Result<Selection, EngineError> {
    if let Some(requested) = &input.requested_workflow_id {
        if !definitions.contains_workflow(requested) {
            return Err(EngineError::UnknownWorkflow(requested.clone()));
        }
        return Ok(Selection {
            workflow_id: requested.clone(),
            reason: SelectionReason::Explicit,
            matched_rule_id: None,
        });
    }

    let rule_set = definitions.rule_set();
    if let Some(rule) = rule_set.rules.iter().find(|r| r.predicates.matches(input)) {
        debug!(rule_id = %rule.id, workflow_id = %rule.workflow_id, "selection rule matched");
        return Ok(Selection {
            workflow_id: rule.workflow_id.clone(),
            reason: SelectionReason::Rule,
            matched_rule_id: Some(rule.id.clone()),
        });
    }

    Ok(Selection {
        workflow_id: rule_set.default_workflow_id.clone(),
        reason: SelectionReason::Default,
        matched_rule_id: None,
    })
}

impl RuleMatch {
    /// Every present, non-empty predicate must hold.
    pub fn matches(&self, input: &SelectionInput) -> bool {
        let priority_ok = match non_empty(&self.priority) {
            None => true,
            Some(set) => input.priority.is_some_and(|p| set.contains(&p)),
        };
        let tags_ok = match non_empty(&self.tags) {
            None => true,
            Some(wanted) => wanted.iter().any(|t| input.tags.contains(t)),
        };

        priority_ok
            && tags_ok
            && keywords_match(non_empty(&self.title_keywords), &input.title)
            && keywords_match(non_empty(&self.goal_keywords), &input.goal)
    }
}

fn non_empty<T>(values: &Option<Vec<T>>) -> Option<&[T]> {
    values.as_deref().filter(|v| !v.is_empty())
}

fn keywords_match(keywords: Option<&[String]>, text: &str) -> bool {
    let Some(keywords) = keywords else {
        return true;
    };
    let haystack = text.to_lowercase();
    keywords.iter().any(|k| haystack.contains(&k.to_lowercase()))
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conditions::ConditionRegistry,
        models::{SelectionRule, SelectionRuleSet, Stage, WorkflowDefinition},
        validator::{Validator, ValidatorConfig},
    };

    fn workflow(id: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(id, vec![Stage::simple("work", "developer")])
    }

    fn definitions(rules: Vec<SelectionRule>) -> DefinitionSet {
        let registry = ConditionRegistry::new();
        Validator::new(&registry, ValidatorConfig::default())
            .load(
                vec![workflow("standard"), workflow("fast-track"), workflow("secure")],
                SelectionRuleSet { default_workflow_id: "standard".into(), rules },
            )
            .expect("fixture definitions are valid")
    }

    fn urgent_rule() -> SelectionRule {
        SelectionRule::new(
            "urgent",
            "fast-track",
            RuleMatch { priority: Some(vec![Priority::P0]), ..Default::default() },
        )
    }

    fn security_rule() -> SelectionRule {
        SelectionRule::new(
            "security",
            "secure",
            RuleMatch { tags: Some(vec!["security".into()]), ..Default::default() },
        )
    }

    #[test]
    fn explicit_known_workflow_wins_over_rules() {
        let defs = definitions(vec![urgent_rule()]);
        let input = SelectionInput { priority: Some(Priority::P0), ..Default::default() }
            .requesting("secure");

        let selection = select(&input, &defs).unwrap();
        assert_eq!(selection.workflow_id, "secure");
        assert_eq!(selection.reason, SelectionReason::Explicit);
        assert_eq!(selection.matched_rule_id, None);
    }

    #[test]
    fn explicit_unknown_workflow_fails() {
        let defs = definitions(vec![]);
        let input = SelectionInput::default().requesting("nope");
        assert!(matches!(
            select(&input, &defs),
            Err(EngineError::UnknownWorkflow(id)) if id == "nope"
        ));
    }

    #[test]
    fn priority_rule_selects_its_workflow() {
        let defs = definitions(vec![urgent_rule()]);
        let input = SelectionInput { priority: Some(Priority::P0), ..Default::default() };

        let selection = select(&input, &defs).unwrap();
        assert_eq!(selection.workflow_id, "fast-track");
        assert_eq!(selection.reason, SelectionReason::Rule);
        assert_eq!(selection.matched_rule_id.as_deref(), Some("urgent"));
    }

    #[test]
    fn no_match_falls_back_to_default() {
        let defs = definitions(vec![urgent_rule()]);
        let input = SelectionInput { priority: Some(Priority::P2), ..Default::default() };

        let selection = select(&input, &defs).unwrap();
        assert_eq!(selection.workflow_id, "standard");
        assert_eq!(selection.reason, SelectionReason::Default);
    }

    #[test]
    fn precedence_decides_between_two_matching_rules() {
        // Listed after `urgent`, but declared to precede it.
        let defs = definitions(vec![urgent_rule(), security_rule().preceding(&["urgent"])]);
        let input = SelectionInput {
            priority: Some(Priority::P0),
            tags: vec!["security".into()],
            ..Default::default()
        };

        let selection = select(&input, &defs).unwrap();
        assert_eq!(selection.matched_rule_id.as_deref(), Some("security"));
    }

    #[test]
    fn keywords_match_case_insensitive_substrings() {
        let predicates = RuleMatch {
            title_keywords: Some(vec!["HOTFIX".into(), "urgent".into()]),
            goal_keywords: Some(vec!["login".into()]),
            ..Default::default()
        };
        let input = SelectionInput {
            title: "Hotfix for prod".into(),
            goal: "Restore the Login page".into(),
            ..Default::default()
        };
        assert!(predicates.matches(&input));

        let wrong_goal = SelectionInput { goal: "faster builds".into(), ..input };
        assert!(!predicates.matches(&wrong_goal));
    }

    #[test]
    fn all_predicates_must_hold() {
        let predicates = RuleMatch {
            priority: Some(vec![Priority::P0, Priority::P1]),
            tags: Some(vec!["frontend".into()]),
            ..Default::default()
        };
        let tagged_only = SelectionInput { tags: vec!["frontend".into()], ..Default::default() };
        assert!(!predicates.matches(&tagged_only));

        let both = SelectionInput { priority: Some(Priority::P1), ..tagged_only };
        assert!(predicates.matches(&both));
    }

    #[test]
    fn empty_predicate_lists_always_match() {
        let predicates = RuleMatch {
            priority: Some(vec![]),
            tags: Some(vec![]),
            title_keywords: Some(vec![]),
            goal_keywords: None,
        };
        assert!(predicates.matches(&SelectionInput::default()));
    }

    #[test]
    fn priority_predicate_does_not_match_missing_priority() {
        let predicates = RuleMatch { priority: Some(vec![Priority::P3]), ..Default::default() };
        assert!(!predicates.matches(&SelectionInput::default()));
    }

    #[test]
    fn input_from_work_item_ignores_bad_priority() {
        let mut item = db::models::NewWorkItem::titled("Fix login").into_record();
        item.priority = Some("urgent".into());
        item.tags = vec!["security".into()];
        item.goal = Some("restore access".into());

        let input = SelectionInput::from_work_item(&item);
        assert_eq!(input.priority, None);
        assert_eq!(input.tags, vec!["security"]);
        assert_eq!(input.goal, "restore access");
    }
}
