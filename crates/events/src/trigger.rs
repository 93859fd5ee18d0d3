//! Normalized trigger events.
//!
//! Every ingress path (webhook, timer, user action, chained job completion)
//! is normalized into a [`TriggerEvent`] before it reaches the route matcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use flowforge_core::{JobId, OrgId};

/// Chain metadata carried by follow-on events emitted when a job completes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainContext {
    /// The job whose completion emitted this event.
    pub parent_job_id: JobId,
    /// Depth of the parent in its chain; the child job runs at `depth + 1`.
    pub depth: u32,
}

/// A normalized business event entering the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    /// Stable event type identifier (e.g. "meeting_ended", "email_received").
    pub event_type: String,
    pub org_id: OrgId,
    /// Opaque event payload; routing conditions and context requirements
    /// read into it by dotted path.
    pub payload: JsonValue,
    /// Stable identifier of the originating thing (email id, meeting id).
    /// Used to derive the idempotency key; events without a source id are
    /// never deduplicated.
    pub source_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    /// Present only on follow-on events emitted by the chaining layer.
    pub chain: Option<ChainContext>,
}

impl TriggerEvent {
    pub fn new(event_type: impl Into<String>, org_id: OrgId, payload: JsonValue) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            org_id,
            payload,
            source_id: None,
            occurred_at: Utc::now(),
            chain: None,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_chain(mut self, chain: ChainContext) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Chain depth of the job this event would create (0 for fresh events).
    pub fn chain_depth(&self) -> u32 {
        self.chain.map_or(0, |c| c.depth + 1)
    }
}
