//! `flowforge-inbox` — prioritization and enrichment of agent outputs.
//!
//! Raw agent outputs land here as inbox items: scored into a 0–100 priority
//! with an urgency band, best-effort enriched, and advanced through a small
//! lifecycle toward resolution. A periodic sweep auto-resolves items whose
//! underlying condition has since resolved and re-scores the rest.

pub mod engine;
pub mod enrich;
pub mod error;
pub mod item;
pub mod scoring;
pub mod store;

pub use engine::{PrioritizationEngine, RawAgentOutput, SweepReport};
pub use enrich::{AlwaysRelevant, Enricher, Enrichment, NoEnrichment, ResolutionProbe};
pub use error::{InboxError, InboxResult};
pub use item::{EnrichmentStatus, InboxItem, ItemStatus, Urgency};
pub use scoring::{PriorityFactors, UrgencyThresholds, score};
pub use store::{InMemoryInboxStore, InboxStore};
