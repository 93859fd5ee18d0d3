//! Engine error taxonomy.
//!
//! Keep this focused on deterministic orchestration failures. The variants
//! map one-to-one onto how a failure propagates:
//!
//! - `Validation` is rejected before a job is created and never retried.
//! - `Timeout` / `ExternalAction` are step failures that propagate per the
//!   step's criticality.
//! - `PolicyRejection` is a deliberate veto (budget cap, rejected approval),
//!   not a system fault, and is surfaced distinctly in observability.
//! - `ChainDepthExceeded` stops chaining without failing the originating job.

use thiserror::Error;

/// Result type used across the orchestrator.
pub type EngineResult<T> = Result<T, EngineError>;

/// Orchestration-level error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Input failed validation (missing context requirement, cyclic DAG, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A step exceeded its declared timeout.
    #[error("step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    /// The invoked skill/action itself failed.
    #[error("external action failed: {0}")]
    ExternalAction(String),

    /// A policy collaborator vetoed the operation (budget, approval).
    #[error("policy rejection: {0}")]
    PolicyRejection(String),

    /// Chaining stopped because the chain depth cap was reached.
    #[error("chain depth {depth} exceeds maximum {max}")]
    ChainDepthExceeded { depth: u32, max: u32 },

    /// An identifier was invalid (parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found.
    #[error("not found")]
    NotFound,

    /// A conflict occurred (duplicate key, illegal state transition).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage-layer failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalAction(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::PolicyRejection(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True for deliberate vetoes, as opposed to system faults.
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::PolicyRejection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_rejections_are_distinguished_from_failures() {
        assert!(EngineError::policy("budget cap exceeded").is_policy());
        assert!(!EngineError::external("boom").is_policy());
    }

    #[test]
    fn timeout_message_names_the_step() {
        let err = EngineError::Timeout {
            step: "draft_followup".to_string(),
            timeout_ms: 5000,
        };
        assert!(err.to_string().contains("draft_followup"));
    }
}
