//! Request/response DTOs.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use flowforge_engine::{Decision, IngressOutcome, Job, JobStatus, StepExecution, StepStatus};
use flowforge_inbox::{EnrichmentStatus, InboxItem, ItemStatus, Urgency};

#[derive(Debug, Deserialize)]
pub struct IngestEventRequest {
    pub event_type: String,
    pub org_id: String,
    pub payload: JsonValue,
    #[serde(default)]
    pub source_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestEventResponse {
    pub job_ids: Vec<String>,
    pub absorbed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_job_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedRoute>,
}

#[derive(Debug, Serialize)]
pub struct RejectedRoute {
    pub sequence_key: String,
    pub reason: String,
}

impl From<IngressOutcome> for IngestEventResponse {
    fn from(outcome: IngressOutcome) -> Self {
        Self {
            job_ids: outcome.job_ids.iter().map(|id| id.to_string()).collect(),
            absorbed: outcome.absorbed,
            existing_job_id: outcome.existing_job_id.map(|id| id.to_string()),
            rejected: outcome
                .rejected
                .into_iter()
                .map(|(sequence_key, reason)| RejectedRoute {
                    sequence_key,
                    reason,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub decision: Decision,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub step: String,
    pub status: StepStatus,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub org_id: String,
    pub sequence_key: String,
    pub version: u32,
    pub status: JobStatus,
    pub chain: ChainResponse,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChainResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    pub child_job_ids: Vec<String>,
    pub depth: u32,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            org_id: job.org_id.to_string(),
            sequence_key: job.sequence_key.clone(),
            version: job.version,
            status: job.status,
            chain: ChainResponse {
                parent_job_id: job.chain.parent_job_id.map(|id| id.to_string()),
                child_job_ids: job.chain.child_job_ids.iter().map(|id| id.to_string()).collect(),
                depth: job.chain.depth,
            },
            created_at: job.created_at.to_rfc3339(),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StepResponse {
    pub step_name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl From<&StepExecution> for StepResponse {
    fn from(step: &StepExecution) -> Self {
        Self {
            step_name: step.step_name.clone(),
            status: step.status,
            output: step.output.clone(),
            error: step.error.clone(),
            attempt: step.attempt,
            duration_ms: step.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InboxItemResponse {
    pub id: String,
    pub org_id: String,
    pub source_agent: String,
    pub item_type: String,
    pub title: String,
    pub priority_score: u8,
    pub urgency: Urgency,
    pub enrichment_status: EnrichmentStatus,
    pub confidence_score: f64,
    pub status: ItemStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&InboxItem> for InboxItemResponse {
    fn from(item: &InboxItem) -> Self {
        Self {
            id: item.id.to_string(),
            org_id: item.org_id.to_string(),
            source_agent: item.source_agent.clone(),
            item_type: item.item_type.clone(),
            title: item.title.clone(),
            priority_score: item.priority_score,
            urgency: item.urgency,
            enrichment_status: item.enrichment_status,
            confidence_score: item.confidence_score,
            status: item.status,
            created_at: item.created_at.to_rfc3339(),
            updated_at: item.updated_at.to_rfc3339(),
        }
    }
}
