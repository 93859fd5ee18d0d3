//! Resolved caller identity.
//!
//! Every external-collaborator call receives an already-resolved principal
//! instead of relying on ambient session state. Resolution (auth, session
//! lookup) happens at the edge; the orchestrator only carries the result.

use serde::{Deserialize, Serialize};

use crate::id::{OrgId, UserId};

/// The `(org, user)` identity on whose behalf a job runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub org_id: OrgId,
    /// Absent for system-triggered jobs (cron ticks, chained events).
    pub user_id: Option<UserId>,
}

impl Principal {
    pub fn new(org_id: OrgId, user_id: Option<UserId>) -> Self {
        Self { org_id, user_id }
    }

    /// Principal for system-originated work (no human actor).
    pub fn system(org_id: OrgId) -> Self {
        Self {
            org_id,
            user_id: None,
        }
    }
}
