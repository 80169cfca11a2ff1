//! Reading definition documents and scripted results from disk / flags.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use engine::{
    ConditionRegistry, DefinitionSet, EngineConfig, Priority, SelectionRuleSet, StageResult,
    StageStatus, Validator, WorkflowDefinition,
};

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not a valid definition document", path.display()))
}

/// Parse and validate a workflow file (a JSON array of workflows) plus an
/// optional rule set file.
///
/// Without a rule set, the first workflow becomes the default and no rules
/// apply.
pub fn load_definitions(
    workflows_path: &Path,
    rules_path: Option<&Path>,
    conditions: &ConditionRegistry,
    config: &EngineConfig,
) -> Result<DefinitionSet> {
    let workflows: Vec<WorkflowDefinition> = read_json(workflows_path)?;
    let rule_set = match rules_path {
        Some(path) => read_json(path)?,
        None => SelectionRuleSet {
            default_workflow_id: workflows
                .first()
                .map(|w| w.id.clone())
                .context("the workflow file contains no workflows")?,
            rules: Vec::new(),
        },
    };

    let definitions = Validator::new(conditions, config.validator.clone()).load(workflows, rule_set)?;
    Ok(definitions)
}

/// Parse `status[:feedback]`, e.g. `approved` or `rejected:missing tests`.
pub fn parse_result(raw: &str) -> Result<StageResult> {
    let (status, feedback) = match raw.split_once(':') {
        Some((status, feedback)) => (status, Some(feedback.trim())),
        None => (raw, None),
    };
    let status: StageStatus = status.parse().map_err(anyhow::Error::msg)?;

    let mut result = StageResult::new(status);
    result.feedback = feedback.filter(|f| !f.is_empty()).map(str::to_owned);
    Ok(result)
}

/// Parse an optional `--priority` flag (`P0`..`P3`, any case).
pub fn parse_priority(raw: Option<&str>) -> Result<Option<Priority>> {
    raw.map(|p| p.parse::<Priority>().map_err(anyhow::Error::msg))
        .transpose()
        .with_context(|| format!("invalid --priority {:?}", raw.unwrap_or_default()))
}
