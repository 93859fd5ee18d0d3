//! Approval decisions.
//!
//! A step marked `requires_approval` completes its own computation (the
//! drafted action lands in the step's output) and parks in
//! `awaiting_approval`; the job is durably parked — no task waits on a
//! human. The decision arrives later through
//! [`JobScheduler::resolve_approval`](crate::scheduler::JobScheduler::resolve_approval).

use serde::{Deserialize, Serialize};

/// External accept/reject signal for a parked step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}
