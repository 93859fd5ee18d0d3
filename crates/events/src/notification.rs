//! Notifications published by the scheduler.
//!
//! These are the engine's only outward side-effect surface. Consumers
//! (Slack/email fan-out, the chaining layer, dashboards) subscribe to the
//! bus; nothing is invoked inline from the scheduling loop.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use flowforge_core::{JobId, OrgId};

/// Lifecycle notifications emitted by the job scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineNotification {
    /// A job reached `completed`.
    JobCompleted { job_id: JobId, org_id: OrgId },

    /// A job reached `failed` (a required step failed fatally).
    JobFailed {
        job_id: JobId,
        org_id: OrgId,
        error: String,
    },

    /// A job was cancelled externally.
    JobCancelled { job_id: JobId, org_id: OrgId },

    /// A step produced a drafted action and is parked awaiting a human
    /// accept/reject decision.
    ApprovalRequested {
        job_id: JobId,
        org_id: OrgId,
        step_name: String,
        drafted_action: JsonValue,
    },

    /// A follow-on event was not emitted because the chain depth cap was
    /// reached. Informational; the originating job is unaffected.
    ChainSuppressed {
        job_id: JobId,
        org_id: OrgId,
        depth: u32,
        max_depth: u32,
    },
}
