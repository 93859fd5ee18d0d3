//! Routing rule model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowforge_core::OrgId;

use crate::condition::Condition;

/// Scope of a routing rule: a single org, or every org.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleScope {
    Global,
    Org { org_id: OrgId },
}

impl RuleScope {
    pub fn org(org_id: OrgId) -> Self {
        Self::Org { org_id }
    }

    /// Whether the rule applies to events from `org_id`.
    pub fn applies_to(&self, org_id: OrgId) -> bool {
        match self {
            RuleScope::Global => true,
            RuleScope::Org { org_id: scoped } => *scoped == org_id,
        }
    }

    pub fn is_org_scoped(&self) -> bool {
        matches!(self, RuleScope::Org { .. })
    }
}

/// Maps an event type to a sequence to run.
///
/// Invariant (enforced by the store): at most one *active* rule per
/// `(scope, event_type, sequence_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub scope: RuleScope,
    pub event_type: String,
    /// Key of the sequence to instantiate on match.
    pub sequence_key: String,
    /// Higher fires first when one event matches several rules.
    pub priority: i32,
    /// Optional predicate over the event payload. Evaluation failures are
    /// treated as non-match, never as errors.
    pub condition: Option<Condition>,
    pub active: bool,
}

impl RoutingRule {
    pub fn new(
        scope: RuleScope,
        event_type: impl Into<String>,
        sequence_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            scope,
            event_type: event_type.into(),
            sequence_key: sequence_key.into(),
            priority: 0,
            condition: None,
            active: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// The uniqueness key for the active-rule invariant.
    pub fn identity(&self) -> (RuleScope, &str, &str) {
        (self.scope, self.event_type.as_str(), self.sequence_key.as_str())
    }
}
