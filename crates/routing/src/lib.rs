//! Event routing: rules, declarative conditions, and the route matcher.
//!
//! Routing is config-as-data: rules are rows in a store, conditions are a
//! small declarative predicate language over the event payload, and matching
//! is a pure read with no side effects.

pub mod condition;
pub mod matcher;
pub mod rule;
pub mod store;

pub use condition::Condition;
pub use matcher::{RouteMatch, RouteMatcher};
pub use rule::{RoutingRule, RuleScope};
pub use store::{InMemoryRuleStore, RuleStore, RuleStoreError};
