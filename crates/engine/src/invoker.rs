//! Skill invocation boundary.
//!
//! A step's `skill` name resolves to an external callable (CRM action,
//! email draft, Slack message, enrichment lookup). The engine treats it as
//! an opaque `(input) -> (output | error)` function with a declared timeout;
//! what the callable does internally is not the engine's concern.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use flowforge_core::{EngineError, EngineResult, Principal};

/// An external callable a step can invoke.
///
/// Implementations should return `EngineError::ExternalAction` for their own
/// failures and `EngineError::PolicyRejection` for deliberate vetoes; the
/// scheduler propagates the distinction into step status and audit records.
#[async_trait]
pub trait SkillInvoker: Send + Sync {
    async fn invoke(&self, input: &JsonValue, principal: Principal) -> EngineResult<JsonValue>;
}

#[async_trait]
impl<F> SkillInvoker for F
where
    F: Fn(&JsonValue, Principal) -> EngineResult<JsonValue> + Send + Sync,
{
    async fn invoke(&self, input: &JsonValue, principal: Principal) -> EngineResult<JsonValue> {
        self(input, principal)
    }
}

/// Registry mapping skill names to invokers.
#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Arc<dyn SkillInvoker>>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, skill: impl Into<String>, invoker: Arc<dyn SkillInvoker>) {
        if let Ok(mut skills) = self.skills.write() {
            skills.insert(skill.into(), invoker);
        }
    }

    /// Convenience for closures (sync skills and tests).
    pub fn register_fn<F>(&self, skill: impl Into<String>, f: F)
    where
        F: Fn(&JsonValue, Principal) -> EngineResult<JsonValue> + Send + Sync + 'static,
    {
        self.register(skill, Arc::new(f));
    }

    pub fn get(&self, skill: &str) -> EngineResult<Arc<dyn SkillInvoker>> {
        self.skills
            .read()
            .map_err(|e| EngineError::storage(e.to_string()))?
            .get(skill)
            .cloned()
            .ok_or_else(|| EngineError::external(format!("unknown skill: {skill}")))
    }
}
