//! Named stage conditions.
//!
//! A stage refers to its condition by name. Names resolve against a
//! [`ConditionRegistry`]: the closed set of [`BuiltinCondition`]s plus any
//! predicates the embedding application registers before validating its
//! definitions. The validator rejects names the registry does not know
//! (unless configured otherwise), so the runtime fallback in
//! [`ConditionRegistry::evaluate`] only applies to definitions loaded with
//! `unknown_conditions = "allow"`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::models::{InitialContext, Priority};

/// Conditions every registry understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinCondition {
    /// `priority` is `P0` or `P1`.
    IsHighPriority,
    /// A `security` tag is present.
    HasSecurityTag,
    /// A `ui`, `frontend` or `design` tag is present.
    HasUiChanges,
    /// A `docs` / `documentation` tag is present, or `needsDocs` is true.
    NeedsDocumentation,
    /// `acceptanceCriteria` is a non-empty string or list.
    HasAcceptanceCriteria,
}

impl BuiltinCondition {
    pub const ALL: [BuiltinCondition; 5] = [
        Self::IsHighPriority,
        Self::HasSecurityTag,
        Self::HasUiChanges,
        Self::NeedsDocumentation,
        Self::HasAcceptanceCriteria,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::IsHighPriority        => "is_high_priority",
            Self::HasSecurityTag        => "has_security_tag",
            Self::HasUiChanges          => "has_ui_changes",
            Self::NeedsDocumentation    => "needs_documentation",
            Self::HasAcceptanceCriteria => "has_acceptance_criteria",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn evaluate(self, ctx: &InitialContext) -> bool {
        match self {
            Self::IsHighPriority => ctx
                .get("priority")
                .and_then(Value::as_str)
                .and_then(|p| p.parse::<Priority>().ok())
                .is_some_and(|p| p <= Priority::P1),
            Self::HasSecurityTag => has_any_tag(ctx, &["security"]),
            Self::HasUiChanges => has_any_tag(ctx, &["ui", "frontend", "design"]),
            Self::NeedsDocumentation => {
                has_any_tag(ctx, &["docs", "documentation"])
                    || ctx.get("needsDocs").and_then(Value::as_bool).unwrap_or(false)
            }
            Self::HasAcceptanceCriteria => match ctx.get("acceptanceCriteria") {
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(Value::Array(items)) => !items.is_empty(),
                _ => false,
            },
        }
    }
}

fn has_any_tag(ctx: &InitialContext, wanted: &[&str]) -> bool {
    ctx.get("tags")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .any(|tag| wanted.iter().any(|w| tag.eq_ignore_ascii_case(w)))
}

type Predicate = Arc<dyn Fn(&InitialContext) -> bool + Send + Sync>;

/// The set of condition names stages may use.
#[derive(Clone, Default)]
pub struct ConditionRegistry {
    custom: HashMap<String, Predicate>,
}

impl ConditionRegistry {
    /// A registry holding only the built-in conditions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a named predicate. Built-in names cannot be
    /// shadowed; registering one is ignored with a warning.
    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&InitialContext) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        if BuiltinCondition::from_name(&name).is_some() {
            warn!(condition = %name, "ignoring registration that shadows a built-in condition");
            return;
        }
        self.custom.insert(name, Arc::new(predicate));
    }

    pub fn contains(&self, name: &str) -> bool {
        BuiltinCondition::from_name(name).is_some() || self.custom.contains_key(name)
    }

    /// Evaluate `name` against the initial context.
    ///
    /// Unknown names evaluate to `true` (the stage runs) and log a warning.
    pub fn evaluate(&self, name: &str, ctx: &InitialContext) -> bool {
        if let Some(builtin) = BuiltinCondition::from_name(name) {
            return builtin.evaluate(ctx);
        }
        match self.custom.get(name) {
            Some(predicate) => predicate(ctx),
            None => {
                warn!(condition = %name, "unknown condition, treating it as satisfied");
                true
            }
        }
    }
}

impl std::fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut custom: Vec<&str> = self.custom.keys().map(String::as_str).collect();
        custom.sort_unstable();
        f.debug_struct("ConditionRegistry").field("custom", &custom).finish()
    }
}
