//! Append-only action audit log.
//!
//! One record per executed step attempt, written regardless of how the job
//! itself ends. Records are write-once; the only mutation the log supports
//! is pruning past a retention window.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowforge_core::{EngineError, EngineResult, JobId, OrgId};

/// Outcome recorded for a step attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failed,
    /// Drafted and parked awaiting approval.
    Pending,
    Cancelled,
    Skipped,
}

/// Immutable per-step action record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub org_id: OrgId,
    pub job_id: JobId,
    pub step_name: String,
    pub skill: String,
    pub outcome: AuditOutcome,
    pub error_message: Option<String>,
    pub credit_cost: Option<u32>,
    pub execution_ms: Option<u64>,
    /// Chain link: the parent job for chained jobs, the job itself at the
    /// chain root.
    pub chain_id: Option<JobId>,
    /// Scheduling wave in which the step ran (0-indexed).
    pub wave_number: Option<u32>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        org_id: OrgId,
        job_id: JobId,
        step_name: impl Into<String>,
        skill: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            org_id,
            job_id,
            step_name: step_name.into(),
            skill: skill.into(),
            outcome,
            error_message: None,
            credit_cost: None,
            execution_ms: None,
            chain_id: None,
            wave_number: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_cost(mut self, credits: u32) -> Self {
        self.credit_cost = Some(credits);
        self
    }

    pub fn with_execution_ms(mut self, ms: u64) -> Self {
        self.execution_ms = Some(ms);
        self
    }

    pub fn with_chain(mut self, chain_id: JobId, wave_number: u32) -> Self {
        self.chain_id = Some(chain_id);
        self.wave_number = Some(wave_number);
        self
    }
}

/// Audit log abstraction (append + read, never update).
pub trait AuditLog: Send + Sync {
    fn append(&self, record: AuditRecord) -> EngineResult<()>;

    fn for_job(&self, job_id: JobId) -> EngineResult<Vec<AuditRecord>>;

    fn for_org(&self, org_id: OrgId, limit: usize) -> EngineResult<Vec<AuditRecord>>;

    /// Drop records older than `retention`. Returns how many were pruned.
    fn prune(&self, retention: Duration) -> EngineResult<usize>;
}

/// In-memory audit log.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLog for InMemoryAuditLog {
    fn append(&self, record: AuditRecord) -> EngineResult<()> {
        self.records
            .write()
            .map_err(|e| EngineError::storage(e.to_string()))?
            .push(record);
        Ok(())
    }

    fn for_job(&self, job_id: JobId) -> EngineResult<Vec<AuditRecord>> {
        Ok(self
            .records
            .read()
            .map_err(|e| EngineError::storage(e.to_string()))?
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    fn for_org(&self, org_id: OrgId, limit: usize) -> EngineResult<Vec<AuditRecord>> {
        let records = self
            .records
            .read()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        let mut out: Vec<AuditRecord> = records
            .iter()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        out.truncate(limit);
        Ok(out)
    }

    fn prune(&self, retention: Duration) -> EngineResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let mut records = self
            .records
            .write()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        let before = records.len();
        records.retain(|r| r.recorded_at >= cutoff);
        Ok(before - records.len())
    }
}
