//! Priority scoring.
//!
//! Scoring is a pure function of the declared factors: the same factors
//! always produce the same score, so re-scoring is idempotent. Urgency bands
//! are configuration, not hard-coded business meaning.

use serde::{Deserialize, Serialize};

use crate::item::Urgency;

/// Declared inputs to the priority score.
///
/// `magnitude` and `signal_strength` are normalized to `[0, 1]` by the
/// producing agent; out-of-range values are clamped rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityFactors {
    /// Hours since the underlying signal occurred. Fresher scores higher.
    pub recency_hours: f64,
    /// Business magnitude of the item (deal size, account tier), normalized.
    pub magnitude: f64,
    /// How strong/unambiguous the originating signal was, normalized.
    pub signal_strength: f64,
}

impl Default for PriorityFactors {
    fn default() -> Self {
        Self {
            recency_hours: 0.0,
            magnitude: 0.5,
            signal_strength: 0.5,
        }
    }
}

/// Score band boundaries, score >= boundary selects the band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrgencyThresholds {
    pub critical: u8,
    pub high: u8,
    pub normal: u8,
}

impl Default for UrgencyThresholds {
    fn default() -> Self {
        Self {
            critical: 80,
            high: 60,
            normal: 30,
        }
    }
}

impl UrgencyThresholds {
    pub fn band(&self, score: u8) -> Urgency {
        if score >= self.critical {
            Urgency::Critical
        } else if score >= self.high {
            Urgency::High
        } else if score >= self.normal {
            Urgency::Normal
        } else {
            Urgency::Low
        }
    }
}

const RECENCY_WEIGHT: f64 = 30.0;
const MAGNITUDE_WEIGHT: f64 = 40.0;
const SIGNAL_WEIGHT: f64 = 30.0;

/// Composite priority score in `[0, 100]`.
///
/// Recency decays with a one-day half-life; magnitude and signal strength
/// contribute linearly.
pub fn score(factors: &PriorityFactors) -> u8 {
    let recency = 1.0 / (1.0 + factors.recency_hours.max(0.0) / 24.0);
    let magnitude = factors.magnitude.clamp(0.0, 1.0);
    let signal = factors.signal_strength.clamp(0.0, 1.0);

    let raw = RECENCY_WEIGHT * recency + MAGNITUDE_WEIGHT * magnitude + SIGNAL_WEIGHT * signal;
    raw.round().clamp(0.0, 100.0) as u8
}
