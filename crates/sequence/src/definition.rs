//! Step and sequence definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Whether a step's failure is fatal for its job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure fails the whole job and skips transitive dependents.
    Required,
    /// Failure is recorded; dependents run with the output absent.
    BestEffort,
}

/// Backoff strategy for step retries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: base * 2^attempt.
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed (1 = no retries).
    pub max_attempts: u32,
    /// Base delay between retries.
    pub base_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry attempt `attempt` (1-indexed; attempt 1 is the
    /// first retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        }
    }

    /// Whether another attempt is allowed after `attempts_so_far` attempts.
    pub fn allows_retry(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}

/// One node in a sequence DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the sequence.
    pub name: String,
    /// Name of the external callable this step invokes.
    pub skill: String,
    /// Names of steps that must be terminal before this step starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub criticality: Criticality,
    /// When set, the step parks in `awaiting_approval` after drafting its
    /// output, until an external accept/reject decision arrives.
    #[serde(default)]
    pub requires_approval: bool,
    /// Per-step execution timeout.
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Credits this step spends; nonzero cost triggers a budget check.
    #[serde(default)]
    pub cost_credits: u32,
    /// Optional static input merged under `"params"` of the step input.
    #[serde(default)]
    pub input_template: Option<JsonValue>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, skill: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skill: skill.into(),
            depends_on: Vec::new(),
            criticality: Criticality::Required,
            requires_approval: false,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::no_retry(),
            cost_credits: 0,
            input_template: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.criticality = Criticality::BestEffort;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cost(mut self, credits: u32) -> Self {
        self.cost_credits = credits;
        self
    }

    pub fn with_input(mut self, template: JsonValue) -> Self {
        self.input_template = Some(template);
        self
    }
}

/// When a chain rule emits its follow-on event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainWhen {
    /// Emit whenever the job reaches a terminal success or failure.
    Always,
    /// Emit only when the job completed.
    OnSuccess,
}

/// Follow-on event declared by a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRule {
    pub emit_event_type: String,
    pub when: ChainWhen,
}

impl ChainRule {
    pub fn on_success(event_type: impl Into<String>) -> Self {
        Self {
            emit_event_type: event_type.into(),
            when: ChainWhen::OnSuccess,
        }
    }

    pub fn always(event_type: impl Into<String>) -> Self {
        Self {
            emit_event_type: event_type.into(),
            when: ChainWhen::Always,
        }
    }
}

/// A versioned, named workflow DAG. Immutable once published; a new version
/// supersedes but never deletes the old one, so running jobs keep the
/// version they started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub sequence_key: String,
    pub version: u32,
    pub steps: Vec<StepDefinition>,
    /// Keys that must be present in the trigger payload (or ambient
    /// principal: "org_id", "user_id") before any step runs.
    #[serde(default)]
    pub context_requirements: Vec<String>,
    #[serde(default)]
    pub chain_into: Vec<ChainRule>,
}

impl SequenceDefinition {
    pub fn new(sequence_key: impl Into<String>, version: u32, steps: Vec<StepDefinition>) -> Self {
        Self {
            sequence_key: sequence_key.into(),
            version,
            steps,
            context_requirements: Vec::new(),
            chain_into: Vec::new(),
        }
    }

    pub fn requiring(mut self, keys: &[&str]) -> Self {
        self.context_requirements = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn chaining(mut self, rules: Vec<ChainRule>) -> Self {
        self.chain_into = rules;
        self
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }
}
