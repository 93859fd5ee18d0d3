//! Enrichment and sweep collaborators.
//!
//! Both are external lookups the engine treats as opaque. Enrichment is
//! best-effort by contract: a failed enrichment marks the item's
//! `enrichment_status` and the item still becomes ready for triage.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::InboxResult;
use crate::item::InboxItem;
use crate::scoring::PriorityFactors;

/// What an enrichment lookup produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    /// Extra context merged into the item payload under `"enrichment"`.
    pub data: JsonValue,
    /// Updated scoring inputs, when the lookup sharpened them.
    pub factors: Option<PriorityFactors>,
}

/// Best-effort context lookup for a fresh inbox item (CRM state, account
/// history, owner).
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, item: &InboxItem) -> InboxResult<Enrichment>;
}

/// Sweep collaborator: has the business condition behind this item since
/// resolved on its own?
#[async_trait]
pub trait ResolutionProbe: Send + Sync {
    async fn still_relevant(&self, item: &InboxItem) -> bool;
}

/// Enricher that adds nothing. Default when no enrichment backend is wired;
/// items go straight to ready with `enrichment_status = Skipped`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnrichment;

#[async_trait]
impl Enricher for NoEnrichment {
    async fn enrich(&self, _item: &InboxItem) -> InboxResult<Enrichment> {
        Ok(Enrichment {
            data: JsonValue::Null,
            factors: None,
        })
    }
}

/// Probe that never auto-resolves.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRelevant;

#[async_trait]
impl ResolutionProbe for AlwaysRelevant {
    async fn still_relevant(&self, _item: &InboxItem) -> bool {
        true
    }
}
