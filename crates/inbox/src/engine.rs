//! The prioritization engine: intake, enrichment, and the periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use flowforge_core::{ItemId, JobId, OrgId};

use crate::enrich::{Enricher, ResolutionProbe};
use crate::error::{InboxError, InboxResult};
use crate::item::{EnrichmentStatus, InboxItem, ItemStatus};
use crate::scoring::{PriorityFactors, UrgencyThresholds};
use crate::store::InboxStore;

/// A raw agent output entering the inbox.
#[derive(Debug, Clone)]
pub struct RawAgentOutput {
    pub org_id: OrgId,
    pub source_agent: String,
    pub item_type: String,
    pub title: String,
    pub payload: JsonValue,
    pub source_job_id: Option<JobId>,
    pub factors: PriorityFactors,
    /// Producing agent's confidence, `[0, 1]`.
    pub confidence: f64,
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub auto_resolved: usize,
    pub rescored: usize,
}

/// Intake, enrichment, and sweep over inbox items.
pub struct PrioritizationEngine {
    store: Arc<dyn InboxStore>,
    enricher: Arc<dyn Enricher>,
    probe: Arc<dyn ResolutionProbe>,
    thresholds: UrgencyThresholds,
}

impl PrioritizationEngine {
    pub fn new(
        store: Arc<dyn InboxStore>,
        enricher: Arc<dyn Enricher>,
        probe: Arc<dyn ResolutionProbe>,
    ) -> Self {
        Self {
            store,
            enricher,
            probe,
            thresholds: UrgencyThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: UrgencyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Score a raw output and store it as an open inbox item.
    pub fn intake(&self, raw: RawAgentOutput) -> InboxResult<InboxItem> {
        let mut item = InboxItem::new(
            raw.org_id,
            raw.source_agent,
            raw.item_type,
            raw.title,
            raw.payload,
            raw.factors,
            &self.thresholds,
        )
        .with_confidence(raw.confidence);
        if let Some(job_id) = raw.source_job_id {
            item = item.with_source_job(job_id);
        }

        self.store.insert(item.clone())?;
        info!(item_id = %item.id, item_type = %item.item_type,
            score = item.priority_score, urgency = ?item.urgency, "inbox item created");
        Ok(item)
    }

    /// Run the enrichment stage for one open item.
    ///
    /// Best-effort: a failed lookup marks `enrichment_status = Failed` and
    /// the item still advances to `Ready`. A lookup that returns nothing
    /// marks it `Skipped`.
    pub async fn run_enrichment(&self, item_id: ItemId) -> InboxResult<InboxItem> {
        let mut item = self
            .store
            .get(item_id)?
            .ok_or(InboxError::NotFound(item_id))?;
        item.advance(ItemStatus::Enriching)?;
        self.store.save(&item)?;

        match self.enricher.enrich(&item).await {
            Ok(enrichment) => {
                if enrichment.data.is_null() && enrichment.factors.is_none() {
                    item.enrichment_status = EnrichmentStatus::Skipped;
                } else {
                    if !enrichment.data.is_null() {
                        if let Some(payload) = item.payload.as_object_mut() {
                            payload.insert("enrichment".to_string(), enrichment.data);
                        }
                    }
                    if let Some(factors) = enrichment.factors {
                        item.factors = factors;
                        item.rescore(&self.thresholds);
                    }
                    item.enrichment_status = EnrichmentStatus::Enriched;
                }
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "enrichment failed; item proceeds unenriched");
                item.enrichment_status = EnrichmentStatus::Failed;
            }
        }

        item.advance(ItemStatus::Ready)?;
        self.store.save(&item)?;
        debug!(item_id = %item.id, enrichment = ?item.enrichment_status, "item ready");
        Ok(item)
    }

    /// Explicit dismissal.
    pub fn dismiss(&self, item_id: ItemId) -> InboxResult<InboxItem> {
        let mut item = self
            .store
            .get(item_id)?
            .ok_or(InboxError::NotFound(item_id))?;
        item.advance(ItemStatus::Dismissed)?;
        self.store.save(&item)?;
        info!(item_id = %item.id, "inbox item dismissed");
        Ok(item)
    }

    /// Periodic sweep over open/ready items.
    ///
    /// Items older than `staleness` whose underlying condition has resolved
    /// are auto-resolved; everything else awaiting resolution is re-scored.
    /// Re-scoring only touches score, urgency, and `updated_at`.
    pub async fn sweep(&self, staleness: Duration, now: DateTime<Utc>) -> InboxResult<SweepReport> {
        let cutoff = now - chrono::Duration::from_std(staleness).unwrap_or_default();
        let mut report = SweepReport::default();

        for mut item in self.store.awaiting()? {
            if item.created_at < cutoff && !self.probe.still_relevant(&item).await {
                item.advance(ItemStatus::AutoResolved)?;
                self.store.save(&item)?;
                report.auto_resolved += 1;
                info!(item_id = %item.id, "inbox item auto-resolved by sweep");
                continue;
            }

            item.rescore(&self.thresholds);
            self.store.save(&item)?;
            report.rescored += 1;
        }

        info!(auto_resolved = report.auto_resolved, rescored = report.rescored, "sweep finished");
        Ok(report)
    }
}
