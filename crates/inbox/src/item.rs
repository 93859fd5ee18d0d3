//! Inbox item model and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use flowforge_core::{ItemId, JobId, OrgId};

use crate::error::{InboxError, InboxResult};
use crate::scoring::{PriorityFactors, UrgencyThresholds, score};

/// Urgency band derived from the priority score.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    High,
    Normal,
    Low,
}

/// Outcome of the enrichment stage. Independent of the item lifecycle: an
/// item whose enrichment failed still becomes `Ready`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    Failed,
    Skipped,
}

/// Inbox item lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Open,
    Enriching,
    Ready,
    Approved,
    Executing,
    Completed,
    Dismissed,
    AutoResolved,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Dismissed | ItemStatus::AutoResolved
        )
    }

    /// Whether the sweep considers this item still awaiting resolution.
    pub fn is_awaiting(&self) -> bool {
        matches!(self, ItemStatus::Open | ItemStatus::Ready)
    }

    fn allows(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        match self {
            Open => matches!(next, Enriching | Ready | Dismissed | AutoResolved),
            Enriching => matches!(next, Ready),
            Ready => matches!(next, Approved | Dismissed | AutoResolved),
            Approved => matches!(next, Executing),
            Executing => matches!(next, Completed),
            Completed | Dismissed | AutoResolved => false,
        }
    }
}

/// A prioritized, enrichable unit of agent output awaiting resolution.
/// Never hard-deleted; `archived` is set after the retention window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: ItemId,
    pub org_id: OrgId,
    /// Which agent produced this item (e.g. "pipeline_watcher").
    pub source_agent: String,
    pub item_type: String,
    pub title: String,
    pub payload: JsonValue,
    /// The job whose output created this item, when there is one.
    pub source_job_id: Option<JobId>,
    pub priority_score: u8,
    pub urgency: Urgency,
    pub enrichment_status: EnrichmentStatus,
    /// Producing agent's confidence in the item, in `[0, 1]`.
    pub confidence_score: f64,
    pub status: ItemStatus,
    /// Current scoring inputs; re-scoring reads these, nothing else.
    pub factors: PriorityFactors,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboxItem {
    pub fn new(
        org_id: OrgId,
        source_agent: impl Into<String>,
        item_type: impl Into<String>,
        title: impl Into<String>,
        payload: JsonValue,
        factors: PriorityFactors,
        thresholds: &UrgencyThresholds,
    ) -> Self {
        let now = Utc::now();
        let priority_score = score(&factors);
        Self {
            id: ItemId::new(),
            org_id,
            source_agent: source_agent.into(),
            item_type: item_type.into(),
            title: title.into(),
            payload,
            source_job_id: None,
            priority_score,
            urgency: thresholds.band(priority_score),
            enrichment_status: EnrichmentStatus::Pending,
            confidence_score: 1.0,
            status: ItemStatus::Open,
            factors,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_source_job(mut self, job_id: JobId) -> Self {
        self.source_job_id = Some(job_id);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_score = confidence.clamp(0.0, 1.0);
        self
    }

    /// Validated lifecycle transition.
    pub fn advance(&mut self, next: ItemStatus) -> InboxResult<()> {
        if !self.status.allows(next) {
            return Err(InboxError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Recompute score and urgency from the current factors. Touches only
    /// the score, urgency, and `updated_at` fields.
    pub fn rescore(&mut self, thresholds: &UrgencyThresholds) {
        let new_score = score(&self.factors);
        if new_score != self.priority_score {
            self.priority_score = new_score;
            self.urgency = thresholds.band(new_score);
        }
        self.updated_at = Utc::now();
    }
}
