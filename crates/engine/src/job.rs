//! Job and step-execution model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use flowforge_core::{JobId, OrgId, UserId};
use flowforge_sequence::{Criticality, SequenceDefinition};

/// Job lifecycle status. Everything but `Running` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// Step execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    /// Drafted its action and parked pending an external decision.
    AwaitingApproval,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }
}

/// One step attempt record within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_name: String,
    pub status: StepStatus,
    pub input: Option<JsonValue>,
    /// For `AwaitingApproval` this holds the drafted action; on approval it
    /// is promoted into the job context.
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl StepExecution {
    pub fn pending(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            attempt: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn mark_running(&mut self, input: JsonValue) {
        self.status = StepStatus::Running;
        self.input = Some(input);
        self.attempt += 1;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, output: JsonValue) {
        self.status = StepStatus::Succeeded;
        self.output = Some(output);
        self.finish();
    }

    pub fn mark_awaiting_approval(&mut self, drafted: JsonValue) {
        self.status = StepStatus::AwaitingApproval;
        self.output = Some(drafted);
        self.finish();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finish();
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = StepStatus::Cancelled;
        self.finish();
    }

    /// Approval accepted: the drafted output becomes the step's result.
    pub fn resolve_approved(&mut self) {
        self.status = StepStatus::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    /// Approval rejected: a policy rejection, recorded as failure.
    pub fn resolve_rejected(&mut self) {
        self.status = StepStatus::Failed;
        self.error = Some("approval rejected".to_string());
        self.completed_at = Some(Utc::now());
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

/// Parent/child chain metadata for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventChain {
    pub parent_job_id: Option<JobId>,
    pub child_job_ids: Vec<JobId>,
    /// 0 for jobs created from fresh events.
    pub depth: u32,
}

/// One execution instance of a sequence version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub org_id: OrgId,
    pub user_id: Option<UserId>,
    pub sequence_key: String,
    /// The pinned sequence version; later publishes do not affect this job.
    pub version: u32,
    pub status: JobStatus,
    pub trigger_payload: JsonValue,
    /// Unique dedup key; only the primary job of an event carries one.
    pub idempotency_key: Option<String>,
    pub chain: EventChain,
    /// Step outputs keyed by step name, accumulated as steps succeed.
    pub context: Map<String, JsonValue>,
    pub steps: Vec<StepExecution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_definition(
        org_id: OrgId,
        user_id: Option<UserId>,
        definition: &SequenceDefinition,
        trigger_payload: JsonValue,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            org_id,
            user_id,
            sequence_key: definition.sequence_key.clone(),
            version: definition.version,
            status: JobStatus::Running,
            trigger_payload,
            idempotency_key: None,
            chain: EventChain::default(),
            context: Map::new(),
            steps: definition
                .steps
                .iter()
                .map(|s| StepExecution::pending(&s.name))
                .collect(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.step_name == name)
    }

    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn has_awaiting_approval(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.status == StepStatus::AwaitingApproval)
    }

    /// Derive the terminal status once every step is terminal: any failed
    /// required step fails the job, otherwise it completed.
    pub fn derive_terminal_status(&self, definition: &SequenceDefinition) -> JobStatus {
        let required_failed = self.steps.iter().any(|s| {
            s.status == StepStatus::Failed
                && definition
                    .step(&s.step_name)
                    .is_some_and(|d| d.criticality == Criticality::Required)
        });
        if required_failed {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }

    pub fn mark_finished(&mut self, status: JobStatus) {
        self.status = status;
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
