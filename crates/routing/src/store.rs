//! Routing rule storage.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use flowforge_core::OrgId;

use crate::rule::{RoutingRule, RuleScope};

/// Rule store abstraction.
pub trait RuleStore: Send + Sync {
    /// Insert or replace a rule.
    ///
    /// Enforces the active-rule invariant: inserting an active rule whose
    /// `(scope, event_type, sequence_key)` identity collides with a
    /// *different* active rule is rejected.
    fn upsert(&self, rule: RoutingRule) -> Result<(), RuleStoreError>;

    /// Deactivate a rule by id (soft delete; rule stays for audit).
    fn deactivate(&self, rule_id: Uuid) -> Result<(), RuleStoreError>;

    /// All active rules matching the org or global scope for `event_type`.
    /// Unordered; the matcher sorts.
    fn rules_for(&self, org_id: OrgId, event_type: &str) -> Result<Vec<RoutingRule>, RuleStoreError>;
}

impl<T: RuleStore + ?Sized> RuleStore for std::sync::Arc<T> {
    fn upsert(&self, rule: RoutingRule) -> Result<(), RuleStoreError> {
        (**self).upsert(rule)
    }

    fn deactivate(&self, rule_id: Uuid) -> Result<(), RuleStoreError> {
        (**self).deactivate(rule_id)
    }

    fn rules_for(
        &self,
        org_id: OrgId,
        event_type: &str,
    ) -> Result<Vec<RoutingRule>, RuleStoreError> {
        (**self).rules_for(org_id, event_type)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleStoreError {
    #[error("rule not found: {0}")]
    NotFound(Uuid),
    #[error("active rule already exists for ({0:?}, {1}, {2})")]
    DuplicateActive(RuleScope, String, String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory rule store.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<HashMap<Uuid, RoutingRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleStore for InMemoryRuleStore {
    fn upsert(&self, rule: RoutingRule) -> Result<(), RuleStoreError> {
        let mut rules = self
            .rules
            .write()
            .map_err(|e| RuleStoreError::Storage(e.to_string()))?;

        if rule.active {
            let collision = rules
                .values()
                .any(|r| r.active && r.id != rule.id && r.identity() == rule.identity());
            if collision {
                return Err(RuleStoreError::DuplicateActive(
                    rule.scope,
                    rule.event_type.clone(),
                    rule.sequence_key.clone(),
                ));
            }
        }

        rules.insert(rule.id, rule);
        Ok(())
    }

    fn deactivate(&self, rule_id: Uuid) -> Result<(), RuleStoreError> {
        let mut rules = self
            .rules
            .write()
            .map_err(|e| RuleStoreError::Storage(e.to_string()))?;

        let rule = rules
            .get_mut(&rule_id)
            .ok_or(RuleStoreError::NotFound(rule_id))?;
        rule.active = false;
        Ok(())
    }

    fn rules_for(
        &self,
        org_id: OrgId,
        event_type: &str,
    ) -> Result<Vec<RoutingRule>, RuleStoreError> {
        let rules = self
            .rules
            .read()
            .map_err(|e| RuleStoreError::Storage(e.to_string()))?;

        Ok(rules
            .values()
            .filter(|r| r.active && r.event_type == event_type && r.scope.applies_to(org_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_active_identity_is_rejected() {
        let store = InMemoryRuleStore::new();
        let org = OrgId::new();

        store
            .upsert(RoutingRule::new(
                RuleScope::org(org),
                "meeting_ended",
                "meeting_debrief",
            ))
            .unwrap();

        let err = store
            .upsert(RoutingRule::new(
                RuleScope::org(org),
                "meeting_ended",
                "meeting_debrief",
            ))
            .unwrap_err();
        assert!(matches!(err, RuleStoreError::DuplicateActive(..)));
    }

    #[test]
    fn reupserting_the_same_rule_id_is_allowed() {
        let store = InMemoryRuleStore::new();
        let mut rule = RoutingRule::new(RuleScope::Global, "cron_tick", "daily_digest");
        store.upsert(rule.clone()).unwrap();

        rule.priority = 10;
        store.upsert(rule).unwrap();
    }

    #[test]
    fn deactivated_rules_free_the_identity_and_stop_matching() {
        let store = InMemoryRuleStore::new();
        let org = OrgId::new();
        let rule = RoutingRule::new(RuleScope::org(org), "email_received", "triage");
        let rule_id = rule.id;
        store.upsert(rule).unwrap();

        store.deactivate(rule_id).unwrap();
        assert!(store.rules_for(org, "email_received").unwrap().is_empty());

        // Identity is free again.
        store
            .upsert(RoutingRule::new(RuleScope::org(org), "email_received", "triage"))
            .unwrap();
    }

    #[test]
    fn rules_for_filters_by_scope() {
        let store = InMemoryRuleStore::new();
        let org_a = OrgId::new();
        let org_b = OrgId::new();

        store
            .upsert(RoutingRule::new(RuleScope::org(org_a), "meeting_ended", "debrief"))
            .unwrap();
        store
            .upsert(RoutingRule::new(RuleScope::Global, "meeting_ended", "archive"))
            .unwrap();

        let for_b = store.rules_for(org_b, "meeting_ended").unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].sequence_key, "archive");

        let for_a = store.rules_for(org_a, "meeting_ended").unwrap();
        assert_eq!(for_a.len(), 2);
    }
}
