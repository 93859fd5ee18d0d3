//! Cross-event deduplication.
//!
//! The guard's key space is the one hard concurrency invariant of the core:
//! two events with the same key arriving simultaneously must yield exactly
//! one created job. `acquire` is therefore a single atomic insert-or-fetch
//! under one mutex, never a check-then-act pair.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use flowforge_core::{EngineError, EngineResult, JobId};
use flowforge_events::TriggerEvent;

/// Deterministic dedup key for an event: `"{event_type}:{source_id}"`.
/// Events without a source id are never deduplicated.
pub fn derive_key(event: &TriggerEvent) -> Option<String> {
    event
        .source_id
        .as_ref()
        .map(|source| format!("{}:{}", event.event_type, source))
}

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    /// The key was free; the caller now owns it and must `bind` or
    /// `release` it.
    Created,
    /// The key is held. The job id is absent only in the brief interval
    /// between a concurrent `acquire` and its `bind`.
    Existing(Option<JobId>),
}

/// Idempotency guard abstraction.
///
/// Lifecycle of a key: `acquire` → `bind(job_id)` → (job runs) →
/// `mark_terminal` when the job finishes. The entry absorbs duplicates
/// while the job is non-terminal and for `window` after it turns terminal;
/// after that the key can be acquired again.
pub trait IdempotencyGuard: Send + Sync {
    fn acquire(&self, key: &str, window: Duration) -> EngineResult<Acquired>;

    /// Attach the created job to a held key.
    fn bind(&self, key: &str, job_id: JobId) -> EngineResult<()>;

    /// Start the post-terminal expiry window for a key.
    fn mark_terminal(&self, key: &str) -> EngineResult<()>;

    /// Free a key without ever binding it (e.g. job creation failed
    /// validation). The next acquire succeeds immediately.
    fn release(&self, key: &str) -> EngineResult<()>;
}

#[derive(Debug, Clone)]
struct GuardEntry {
    job_id: Option<JobId>,
    terminal_at: Option<DateTime<Utc>>,
}

/// In-memory guard.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyGuard {
    entries: Mutex<HashMap<String, GuardEntry>>,
}

impl InMemoryIdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyGuard for InMemoryIdempotencyGuard {
    fn acquire(&self, key: &str, window: Duration) -> EngineResult<Acquired> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| EngineError::storage(e.to_string()))?;

        let now = Utc::now();
        match entries.get(key) {
            Some(entry) => {
                let expired = entry.terminal_at.is_some_and(|t| {
                    let window = chrono::Duration::from_std(window).unwrap_or_default();
                    now >= t + window
                });
                if expired {
                    entries.insert(
                        key.to_string(),
                        GuardEntry {
                            job_id: None,
                            terminal_at: None,
                        },
                    );
                    Ok(Acquired::Created)
                } else {
                    Ok(Acquired::Existing(entry.job_id))
                }
            }
            None => {
                entries.insert(
                    key.to_string(),
                    GuardEntry {
                        job_id: None,
                        terminal_at: None,
                    },
                );
                Ok(Acquired::Created)
            }
        }
    }

    fn bind(&self, key: &str, job_id: JobId) -> EngineResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        if let Some(entry) = entries.get_mut(key) {
            entry.job_id = Some(job_id);
        }
        Ok(())
    }

    fn mark_terminal(&self, key: &str) -> EngineResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        if let Some(entry) = entries.get_mut(key) {
            entry.terminal_at = Some(Utc::now());
        }
        Ok(())
    }

    fn release(&self, key: &str) -> EngineResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}
