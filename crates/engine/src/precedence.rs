//! Selection-rule precedence ordering.
//!
//! Rules enforced:
//! 1. Rule IDs must be unique within the rule set.
//! 2. Every `precedes` entry must name another rule of the set (not itself).
//! 3. The precedence graph must be acyclic (topological sort must succeed).
//!
//! Among rules whose predecessors have all been placed, the one listed first
//! in the input goes next, so unrelated rules keep their authored order and
//! the result is the same on every call.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::{EngineError, models::SelectionRule};

/// Return `rules` reordered so that every `A.precedes ∋ B` puts `A` before `B`.
///
/// # Errors
/// - [`EngineError::DuplicateRuleId`] if two rules share an ID.
/// - [`EngineError::SelfPrecedence`] if a rule lists itself in `precedes`.
/// - [`EngineError::UnknownPrecedenceTarget`] if `precedes` names a missing rule.
/// - [`EngineError::PrecedenceCycle`] naming every rule the sort could not place.
pub fn order_by_precedence(rules: &[SelectionRule]) -> Result<Vec<SelectionRule>, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Index rules by ID, rejecting duplicates
    // -----------------------------------------------------------------------
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(rules.len());
    for (i, rule) in rules.iter().enumerate() {
        if index.insert(rule.id.as_str(), i).is_some() {
            return Err(EngineError::DuplicateRuleId(rule.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Build successor lists and in-degrees
    // -----------------------------------------------------------------------
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); rules.len()];
    let mut in_degree: Vec<usize> = vec![0; rules.len()];

    for (from, rule) in rules.iter().enumerate() {
        for target in &rule.precedes {
            if *target == rule.id {
                return Err(EngineError::SelfPrecedence(rule.id.clone()));
            }
            let to = *index.get(target.as_str()).ok_or_else(|| {
                EngineError::UnknownPrecedenceTarget {
                    rule_id: rule.id.clone(),
                    target: target.clone(),
                }
            })?;
            // Repeated entries describe the same edge.
            if successors[from].contains(&to) {
                continue;
            }
            successors[from].push(to);
            in_degree[to] += 1;
        }
    }

    // -----------------------------------------------------------------------
    // 3. Kahn's algorithm, smallest original index first
    // -----------------------------------------------------------------------
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order: Vec<usize> = Vec::with_capacity(rules.len());

    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &successors[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    // Anything never placed still has an unsatisfied predecessor.
    if order.len() != rules.len() {
        let stuck = rules
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, r)| r.id.clone())
            .collect();
        return Err(EngineError::PrecedenceCycle(stuck));
    }

    Ok(order.into_iter().map(|i| rules[i].clone()).collect())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleMatch;

    fn rule(id: &str, precedes: &[&str]) -> SelectionRule {
        SelectionRule::new(id, "wf", RuleMatch::default()).preceding(precedes)
    }

    fn ids(rules: &[SelectionRule]) -> Vec<&str> {
        rules.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn unrelated_rules_keep_their_order() {
        let rules = vec![rule("a", &[]), rule("b", &[]), rule("c", &[])];
        let ordered = order_by_precedence(&rules).expect("should be acyclic");
        assert_eq!(ids(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn precedence_moves_later_rule_forward() {
        // c must be evaluated before a.
        let rules = vec![rule("a", &[]), rule("b", &[]), rule("c", &["a"])];
        let ordered = order_by_precedence(&rules).expect("should be acyclic");
        assert_eq!(ids(&ordered), vec!["b", "c", "a"]);
    }

    #[test]
    fn ties_break_by_original_index() {
        //   d → b, d → a ; c unrelated
        let rules = vec![rule("a", &[]), rule("b", &[]), rule("c", &[]), rule("d", &["b", "a"])];
        let ordered = order_by_precedence(&rules).expect("should be acyclic");
        assert_eq!(ids(&ordered), vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn every_edge_is_respected_and_order_is_stable() {
        let rules = vec![
            rule("security", &["frontend"]),
            rule("frontend", &[]),
            rule("hotfix", &["security", "docs"]),
            rule("docs", &[]),
        ];
        let first = order_by_precedence(&rules).expect("should be acyclic");
        let position = |id: &str| first.iter().position(|r| r.id == id).unwrap();

        for r in &rules {
            for target in &r.precedes {
                assert!(position(&r.id) < position(target), "{} must precede {}", r.id, target);
            }
        }

        for _ in 0..5 {
            assert_eq!(ids(&order_by_precedence(&rules).unwrap()), ids(&first));
        }
    }

    #[test]
    fn cycle_reports_every_unplaced_rule() {
        // a → b → c → a, d free
        let rules = vec![rule("a", &["b"]), rule("b", &["c"]), rule("c", &["a"]), rule("d", &[])];
        match order_by_precedence(&rules) {
            Err(EngineError::PrecedenceCycle(stuck)) => assert_eq!(stuck, vec!["a", "b", "c"]),
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn two_separate_cycles_are_reported_together() {
        let rules = vec![rule("a", &["b"]), rule("b", &["a"]), rule("x", &["y"]), rule("y", &["x"])];
        match order_by_precedence(&rules) {
            Err(EngineError::PrecedenceCycle(stuck)) => {
                assert_eq!(stuck, vec!["a", "b", "x", "y"])
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn self_precedence_is_rejected() {
        let rules = vec![rule("a", &["a"])];
        assert!(matches!(
            order_by_precedence(&rules),
            Err(EngineError::SelfPrecedence(id)) if id == "a"
        ));
    }

    #[test]
    fn unknown_precedence_target_is_rejected() {
        let rules = vec![rule("a", &["ghost"])];
        assert!(matches!(
            order_by_precedence(&rules),
            Err(EngineError::UnknownPrecedenceTarget { target, .. }) if target == "ghost"
        ));
    }

    #[test]
    fn duplicate_rule_id_is_rejected() {
        let rules = vec![rule("a", &[]), rule("a", &[])];
        assert!(matches!(
            order_by_precedence(&rules),
            Err(EngineError::DuplicateRuleId(id)) if id == "a"
        ));
    }

    #[test]
    fn empty_rule_list_is_valid() {
        assert!(order_by_precedence(&[]).unwrap().is_empty());
    }
}
