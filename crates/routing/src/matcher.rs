//! Route matching.

use serde_json::Value as JsonValue;
use tracing::warn;

use flowforge_core::OrgId;

use crate::rule::RoutingRule;
use crate::store::{RuleStore, RuleStoreError};

/// One matched route: the sequence to run and the priority it matched at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub sequence_key: String,
    pub priority: i32,
    pub org_scoped: bool,
}

/// Matches incoming events against configured routing rules.
///
/// Pure read: no side effects on the store or the event.
pub struct RouteMatcher<S> {
    store: S,
}

impl<S: RuleStore> RouteMatcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// All matching routes for `(org_id, event_type)` against `payload`,
    /// ordered by priority descending; org-scoped rules outrank global
    /// rules at equal priority.
    ///
    /// Rules whose condition evaluates false (including any evaluation
    /// failure, which fails closed) are dropped silently.
    pub fn matches(
        &self,
        org_id: OrgId,
        event_type: &str,
        payload: &JsonValue,
    ) -> Result<Vec<RouteMatch>, RuleStoreError> {
        let rules = self.store.rules_for(org_id, event_type)?;

        let mut matched: Vec<RouteMatch> = rules
            .into_iter()
            .filter(|rule| self.condition_holds(rule, payload))
            .map(|rule| RouteMatch {
                org_scoped: rule.scope.is_org_scoped(),
                sequence_key: rule.sequence_key,
                priority: rule.priority,
            })
            .collect();

        matched.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.org_scoped.cmp(&a.org_scoped))
                .then(a.sequence_key.cmp(&b.sequence_key))
        });

        Ok(matched)
    }

    fn condition_holds(&self, rule: &RoutingRule, payload: &JsonValue) -> bool {
        match &rule.condition {
            None => true,
            Some(condition) => {
                let holds = condition.evaluate(payload);
                if !holds {
                    warn!(
                        rule_id = %rule.id,
                        event_type = %rule.event_type,
                        "routing condition did not hold; rule does not fire"
                    );
                }
                holds
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::rule::RuleScope;
    use crate::store::InMemoryRuleStore;
    use serde_json::json;

    fn matcher_with(rules: Vec<RoutingRule>) -> RouteMatcher<InMemoryRuleStore> {
        let store = InMemoryRuleStore::new();
        for rule in rules {
            store.upsert(rule).unwrap();
        }
        RouteMatcher::new(store)
    }

    #[test]
    fn never_returns_other_event_types() {
        let org = OrgId::new();
        let matcher = matcher_with(vec![
            RoutingRule::new(RuleScope::org(org), "meeting_ended", "debrief"),
            RoutingRule::new(RuleScope::org(org), "email_received", "triage"),
        ]);

        let matches = matcher.matches(org, "meeting_ended", &json!({})).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].sequence_key, "debrief");
    }

    #[test]
    fn org_rules_outrank_global_at_equal_priority() {
        let org = OrgId::new();
        let matcher = matcher_with(vec![
            RoutingRule::new(RuleScope::Global, "meeting_ended", "generic_debrief")
                .with_priority(5),
            RoutingRule::new(RuleScope::org(org), "meeting_ended", "custom_debrief")
                .with_priority(5),
        ]);

        let matches = matcher.matches(org, "meeting_ended", &json!({})).unwrap();
        assert_eq!(matches[0].sequence_key, "custom_debrief");
        assert_eq!(matches[1].sequence_key, "generic_debrief");
    }

    #[test]
    fn higher_priority_fires_first_regardless_of_scope() {
        let org = OrgId::new();
        let matcher = matcher_with(vec![
            RoutingRule::new(RuleScope::org(org), "meeting_ended", "low").with_priority(1),
            RoutingRule::new(RuleScope::Global, "meeting_ended", "high").with_priority(9),
        ]);

        let matches = matcher.matches(org, "meeting_ended", &json!({})).unwrap();
        assert_eq!(matches[0].sequence_key, "high");
    }

    #[test]
    fn failing_condition_drops_the_rule_not_the_match() {
        let org = OrgId::new();
        let matcher = matcher_with(vec![
            RoutingRule::new(RuleScope::org(org), "deal_updated", "escalate").with_condition(
                Condition::Gt {
                    path: "amount".to_string(),
                    value: 10_000.0,
                },
            ),
            RoutingRule::new(RuleScope::org(org), "deal_updated", "log_change"),
        ]);

        // Payload without "amount": the conditioned rule fails closed, the
        // unconditioned rule still matches.
        let matches = matcher.matches(org, "deal_updated", &json!({})).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].sequence_key, "log_change");
    }
}
