//! `flowforge-engine` — the job scheduler/executor.
//!
//! Turns a matched `(sequence_key, version)` and a trigger payload into a
//! running job: idempotency-guarded creation, topological step execution
//! with bounded concurrency and per-step timeouts, criticality-aware failure
//! propagation, approval gates that park the job (not a thread), audit
//! logging for every step attempt, and depth-capped chaining of follow-on
//! events.

pub mod approval;
pub mod audit;
pub mod budget;
pub mod idempotency;
pub mod invoker;
pub mod job;
pub mod scheduler;
pub mod store;

pub use approval::Decision;
pub use audit::{AuditLog, AuditOutcome, AuditRecord, InMemoryAuditLog};
pub use budget::{BudgetDecision, BudgetService, UnlimitedBudget};
pub use idempotency::{Acquired, IdempotencyGuard, InMemoryIdempotencyGuard, derive_key};
pub use invoker::{SkillInvoker, SkillRegistry};
pub use job::{EventChain, Job, JobStatus, StepExecution, StepStatus};
pub use scheduler::{IngressOutcome, JobScheduler, SchedulerConfig, SchedulerStats};
pub use store::{InMemoryJobStore, JobStore};
