//! Budget/credit collaborator.
//!
//! Budget state is owned outside the orchestrator core; the scheduler only
//! asks before a cost-bearing step and records spend after success. A
//! disallowed check fails the step as a policy rejection, not a system
//! error.

use async_trait::async_trait;

use flowforge_core::{EngineResult, OrgId};

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub spent: u64,
    pub cap: u64,
}

#[async_trait]
pub trait BudgetService: Send + Sync {
    /// Whether `org_id` may spend `credits` right now.
    async fn check(&self, org_id: OrgId, credits: u32) -> EngineResult<BudgetDecision>;

    /// Record that `credits` were actually spent.
    async fn record_spend(&self, org_id: OrgId, credits: u32) -> EngineResult<()>;
}

/// Budget service that never vetoes. Default collaborator when no budget
/// backend is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedBudget;

#[async_trait]
impl BudgetService for UnlimitedBudget {
    async fn check(&self, _org_id: OrgId, _credits: u32) -> EngineResult<BudgetDecision> {
        Ok(BudgetDecision {
            allowed: true,
            spent: 0,
            cap: u64::MAX,
        })
    }

    async fn record_spend(&self, _org_id: OrgId, _credits: u32) -> EngineResult<()> {
        Ok(())
    }
}
