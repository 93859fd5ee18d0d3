//! The job scheduler/executor.
//!
//! One `handle_event` call drains a whole chain: the trigger event is
//! guarded, routed, and executed, and any follow-on events its jobs emit
//! re-enter the same loop until the chain depth cap cuts them off.
//!
//! Concurrency model: each job is driven by exactly one task at a time (its
//! drive loop). Ready steps are spawned onto the runtime, bounded by a
//! shared semaphore; the drive loop is the single writer for step status
//! transitions, so dependents always observe a dependency's terminal state
//! before they start. Approval-gated steps park the *job* — the drive loop
//! returns and nothing waits; `resolve_approval` resumes it later.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value as JsonValue, json};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use flowforge_core::{EngineError, EngineResult, JobId, Principal, UserId};
use flowforge_events::{ChainContext, EngineNotification, EventBus, TriggerEvent};
use flowforge_routing::{RouteMatcher, RuleStore};
use flowforge_sequence::{
    ChainWhen, Criticality, SequenceDefinition, SequenceRegistry, StepDefinition,
};

use crate::approval::Decision;
use crate::audit::{AuditLog, AuditOutcome, AuditRecord};
use crate::budget::BudgetService;
use crate::idempotency::{Acquired, IdempotencyGuard, derive_key};
use crate::invoker::SkillRegistry;
use crate::job::{Job, JobStatus, StepStatus};
use crate::store::JobStore;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on steps running concurrently across all jobs.
    pub max_concurrent_steps: usize,
    /// Jobs deeper than this in a chain are never created.
    pub max_chain_depth: u32,
    /// How long after a job turns terminal its idempotency key keeps
    /// absorbing duplicates.
    pub idempotency_window: Duration,
    /// Whether a timed-out *required* step consumes its retry policy before
    /// failing the job. Best-effort steps always retry per policy.
    pub retry_timed_out_required: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 8,
            max_chain_depth: 5,
            idempotency_window: Duration::from_secs(3600),
            retry_timed_out_required: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent_steps(mut self, max: usize) -> Self {
        self.max_concurrent_steps = max.max(1);
        self
    }

    pub fn with_max_chain_depth(mut self, depth: u32) -> Self {
        self.max_chain_depth = depth;
        self
    }

    pub fn with_idempotency_window(mut self, window: Duration) -> Self {
        self.idempotency_window = window;
        self
    }

    pub fn with_retry_timed_out_required(mut self, retry: bool) -> Self {
        self.retry_timed_out_required = retry;
        self
    }
}

/// Scheduler runtime counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStats {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub events_absorbed: u64,
    pub events_unrouted: u64,
    pub steps_executed: u64,
    pub chains_suppressed: u64,
}

/// What happened to one ingress call (the whole chain included).
#[derive(Debug, Clone, Default)]
pub struct IngressOutcome {
    /// Jobs created, in creation order, chained jobs included.
    pub job_ids: Vec<JobId>,
    /// Set when the guard absorbed the event instead of creating jobs.
    pub absorbed: bool,
    /// The job already holding the event's idempotency key, if known.
    pub existing_job_id: Option<JobId>,
    /// Matches that failed validation before any step ran:
    /// `(sequence_key, reason)`.
    pub rejected: Vec<(String, String)>,
}

enum DriveOutcome {
    /// Every step terminal; the job has been finalized.
    Finished,
    /// At least one step awaits approval and nothing else can run.
    Parked,
    /// Cancellation observed; the job has been finalized as cancelled.
    Cancelled,
}

#[derive(Debug)]
enum StepTaskResult {
    Succeeded(JsonValue),
    /// Computation done, awaiting approval with this drafted action.
    Drafted(JsonValue),
    Failed { error: EngineError, attempts: u32 },
    PolicyRejected(EngineError),
    Cancelled,
}

/// The orchestrator core: event in, jobs out.
pub struct JobScheduler<B> {
    matcher: RouteMatcher<Arc<dyn RuleStore>>,
    registry: Arc<dyn SequenceRegistry>,
    jobs: Arc<dyn JobStore>,
    guard: Arc<dyn IdempotencyGuard>,
    skills: Arc<SkillRegistry>,
    budget: Arc<dyn BudgetService>,
    audit: Arc<dyn AuditLog>,
    bus: Arc<B>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    stats: Mutex<SchedulerStats>,
    /// Cancellation senders for jobs currently being driven.
    cancel_senders: Mutex<HashMap<JobId, watch::Sender<bool>>>,
    /// Per-job drive locks: one driver at a time per job.
    drive_locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<B> JobScheduler<B>
where
    B: EventBus<EngineNotification> + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: Arc<dyn RuleStore>,
        registry: Arc<dyn SequenceRegistry>,
        jobs: Arc<dyn JobStore>,
        guard: Arc<dyn IdempotencyGuard>,
        skills: Arc<SkillRegistry>,
        budget: Arc<dyn BudgetService>,
        audit: Arc<dyn AuditLog>,
        bus: Arc<B>,
    ) -> Self {
        let config = SchedulerConfig::default();
        Self {
            matcher: RouteMatcher::new(rules),
            registry,
            jobs,
            guard,
            skills,
            budget,
            audit,
            bus,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_steps)),
            config,
            stats: Mutex::new(SchedulerStats::default()),
            cancel_senders: Mutex::new(HashMap::new()),
            drive_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.semaphore = Arc::new(Semaphore::new(config.max_concurrent_steps));
        self.config = config;
        self
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Ingest one trigger event and run it (and its chain) to quiescence:
    /// every created job is either terminal or parked awaiting approval when
    /// this returns.
    pub async fn handle_event(&self, event: TriggerEvent) -> EngineResult<IngressOutcome> {
        let mut outcome = IngressOutcome::default();
        let mut queue = VecDeque::from([event]);
        self.run_queue(&mut queue, &mut outcome).await?;
        Ok(outcome)
    }

    /// Apply an external accept/reject decision to a parked step and resume
    /// the job. Idempotent: deciding an already-resolved step is a no-op
    /// that returns its current status.
    pub async fn resolve_approval(
        &self,
        job_id: JobId,
        step_name: &str,
        decision: Decision,
    ) -> EngineResult<StepStatus> {
        let lock = self.drive_lock(job_id);
        let _guard = lock.lock().await;

        let mut job = match self.jobs.get(job_id)? {
            Some(job) => job,
            None => {
                self.discard_drive_lock(job_id);
                return Err(EngineError::NotFound);
            }
        };
        let definition = self
            .registry
            .get(&job.sequence_key, job.version)
            .map_err(|e| EngineError::storage(e.to_string()))?;

        let step_def = definition
            .step(step_name)
            .ok_or_else(|| EngineError::validation(format!("unknown step: {step_name}")))?
            .clone();
        let current = job
            .step(step_name)
            .ok_or_else(|| EngineError::validation(format!("unknown step: {step_name}")))?
            .status;

        if current != StepStatus::AwaitingApproval {
            debug!(job_id = %job_id, step = %step_name, status = ?current,
                "approval decision for already-resolved step ignored");
            if job.status.is_terminal() && job.all_steps_terminal() {
                self.discard_drive_lock(job_id);
            }
            return Ok(current);
        }

        match decision {
            Decision::Approve => {
                let output = job
                    .step(step_name)
                    .and_then(|s| s.output.clone())
                    .unwrap_or(JsonValue::Null);
                if let Some(step) = job.step_mut(step_name) {
                    step.resolve_approved();
                }
                job.context.insert(step_name.to_string(), output);
                self.audit.append(AuditRecord::new(
                    job.org_id,
                    job.id,
                    step_name,
                    step_def.skill.as_str(),
                    AuditOutcome::Success,
                ))?;
                info!(job_id = %job_id, step = %step_name, "step approved");
            }
            Decision::Reject => {
                if let Some(step) = job.step_mut(step_name) {
                    step.resolve_rejected();
                }
                if step_def.criticality == Criticality::Required {
                    job.status = JobStatus::Failed;
                }
                self.audit.append(
                    AuditRecord::new(
                        job.org_id,
                        job.id,
                        step_name,
                        step_def.skill.as_str(),
                        AuditOutcome::Failed,
                    )
                    .with_error("approval rejected"),
                )?;
                info!(job_id = %job_id, step = %step_name, "step rejected");
            }
        }
        job.touch();
        self.jobs.save(&job)?;
        let resolved = job
            .step(step_name)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Failed);

        // Resume the job; follow-on events from its completion run here too.
        let follow_ons = self.drive_to_rest(&mut job, &definition).await?;
        let mut outcome = IngressOutcome::default();
        let mut queue: VecDeque<TriggerEvent> = follow_ons.into();
        self.run_queue(&mut queue, &mut outcome).await?;

        Ok(resolved)
    }

    /// Cancel a job. In-flight steps observe the signal at their next
    /// suspension point; parked or not-yet-driven jobs are finalized here.
    pub async fn cancel_job(&self, job_id: JobId) -> EngineResult<()> {
        let sent = {
            let senders = self
                .cancel_senders
                .lock()
                .map_err(|e| EngineError::storage(e.to_string()))?;
            senders.get(&job_id).map(|tx| tx.send(true).is_ok())
        };
        if sent == Some(true) {
            return Ok(());
        }

        // No active driver: parked (awaiting approval) or unknown.
        let lock = self.drive_lock(job_id);
        let _guard = lock.lock().await;
        let mut job = match self.jobs.get(job_id)? {
            Some(job) => job,
            None => {
                self.discard_drive_lock(job_id);
                return Err(EngineError::NotFound);
            }
        };
        if job.status.is_terminal() {
            self.discard_drive_lock(job_id);
            return Ok(());
        }
        for step in &mut job.steps {
            if !step.status.is_terminal() {
                step.mark_cancelled();
            }
        }
        self.finalize_cancelled(&mut job)?;
        self.discard_drive_lock(job_id);
        Ok(())
    }

    // ── Event pipeline ──────────────────────────────────────────────────

    async fn run_queue(
        &self,
        queue: &mut VecDeque<TriggerEvent>,
        outcome: &mut IngressOutcome,
    ) -> EngineResult<()> {
        while let Some(event) = queue.pop_front() {
            let follow_ons = self.process_event(&event, outcome).await?;
            queue.extend(follow_ons);
        }
        Ok(())
    }

    /// Guard, route, create, and run the jobs for one event. Returns the
    /// follow-on events its jobs emitted.
    async fn process_event(
        &self,
        event: &TriggerEvent,
        outcome: &mut IngressOutcome,
    ) -> EngineResult<Vec<TriggerEvent>> {
        let key = derive_key(event);

        if let Some(key) = &key {
            match self.guard.acquire(key, self.config.idempotency_window)? {
                Acquired::Created => {}
                Acquired::Existing(existing) => {
                    debug!(key = %key, existing = ?existing, "duplicate event absorbed");
                    self.bump(|s| s.events_absorbed += 1);
                    outcome.absorbed = true;
                    outcome.existing_job_id = existing;
                    return Ok(Vec::new());
                }
            }
        }

        let matches = self
            .matcher
            .matches(event.org_id, &event.event_type, &event.payload)
            .map_err(|e| EngineError::storage(e.to_string()))?;

        if matches.is_empty() {
            debug!(event_type = %event.event_type, "no routing rule matched");
            self.bump(|s| s.events_unrouted += 1);
            if let Some(key) = &key {
                self.guard.release(key)?;
            }
            return Ok(Vec::new());
        }

        let principal = Principal::new(event.org_id, ambient_user(&event.payload));
        let mut created: Vec<JobId> = Vec::new();
        let mut follow_ons = Vec::new();

        for route in matches {
            let definition = match self.registry.latest(&route.sequence_key) {
                Ok(d) => d,
                Err(e) => {
                    warn!(sequence_key = %route.sequence_key, error = %e,
                        "matched rule points at unknown sequence");
                    outcome
                        .rejected
                        .push((route.sequence_key.clone(), e.to_string()));
                    continue;
                }
            };

            if let Err(e) = validate_context(&definition, event, principal) {
                warn!(sequence_key = %route.sequence_key, error = %e,
                    "context requirements not satisfied; job not created");
                outcome
                    .rejected
                    .push((route.sequence_key.clone(), e.to_string()));
                continue;
            }

            let mut job = Job::from_definition(
                event.org_id,
                principal.user_id,
                &definition,
                event.payload.clone(),
            );
            if let Some(chain) = event.chain {
                job.chain.parent_job_id = Some(chain.parent_job_id);
                job.chain.depth = event.chain_depth();
            }
            // Only the event's primary job carries the dedup key; the guard
            // absorbs at event granularity either way.
            if created.is_empty() {
                job.idempotency_key = key.clone();
            }
            let job_id = job.id;
            self.jobs.insert(job)?;
            if created.is_empty() {
                if let Some(key) = &key {
                    self.guard.bind(key, job_id)?;
                }
            }
            if let Some(chain) = event.chain {
                // Parent may already be gone from the store in theory; a
                // missing parent only loses the back-reference.
                if let Err(e) = self.jobs.record_child(chain.parent_job_id, job_id) {
                    warn!(parent = %chain.parent_job_id, error = %e, "failed to record chain child");
                }
            }
            created.push(job_id);
            outcome.job_ids.push(job_id);
            self.bump(|s| s.jobs_started += 1);
            info!(job_id = %job_id, sequence_key = %route.sequence_key,
                version = definition.version, depth = event.chain_depth(), "job created");

            follow_ons.extend(self.run_job(job_id, &definition).await?);
        }

        if created.is_empty() {
            if let Some(key) = &key {
                self.guard.release(key)?;
            }
        }

        Ok(follow_ons)
    }

    /// Drive one job until it finishes or parks; returns follow-on events.
    async fn run_job(
        &self,
        job_id: JobId,
        definition: &SequenceDefinition,
    ) -> EngineResult<Vec<TriggerEvent>> {
        let lock = self.drive_lock(job_id);
        let _guard = lock.lock().await;

        let mut job = self.jobs.get(job_id)?.ok_or(EngineError::NotFound)?;
        self.drive_to_rest(&mut job, definition).await
    }

    /// Drive a loaded job to a resting state (terminal or parked). Assumes
    /// the caller holds the job's drive lock.
    async fn drive_to_rest(
        &self,
        job: &mut Job,
        definition: &SequenceDefinition,
    ) -> EngineResult<Vec<TriggerEvent>> {
        if job.status.is_terminal() && job.all_steps_terminal() {
            self.discard_drive_lock(job.id);
            return Ok(Vec::new());
        }

        let cancel_rx = self.register_cancel(job.id)?;
        let result = self.drive(job, definition, cancel_rx).await;
        self.unregister_cancel(job.id);

        let events = match result? {
            DriveOutcome::Parked => {
                debug!(job_id = %job.id, "job parked awaiting approval");
                Vec::new()
            }
            DriveOutcome::Cancelled => Vec::new(),
            DriveOutcome::Finished => self.finalize(job, definition)?,
        };
        if job.status.is_terminal() {
            self.discard_drive_lock(job.id);
        }
        Ok(events)
    }

    // ── DAG execution ───────────────────────────────────────────────────

    async fn drive(
        &self,
        job: &mut Job,
        definition: &SequenceDefinition,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> EngineResult<DriveOutcome> {
        type TaskOutput = (String, u32, StepTaskResult);
        let mut join_set: JoinSet<TaskOutput> = JoinSet::new();
        // Which step each spawned task belongs to, so a panicking task can
        // still be attributed and failed instead of stranding the job.
        let mut in_flight: HashMap<tokio::task::Id, (String, u32)> = HashMap::new();
        let mut wave: u32 = 0;

        loop {
            if *cancel_rx.borrow() {
                // In-flight tasks observe the same signal and unwind on
                // their own; their results are dropped with the JoinSet.
                join_set.abort_all();
                let open: Vec<String> = job
                    .steps
                    .iter()
                    .filter(|s| !s.status.is_terminal())
                    .map(|s| s.step_name.clone())
                    .collect();
                for name in &open {
                    if let Some(step) = job.step_mut(name) {
                        step.mark_cancelled();
                    }
                    let skill = definition
                        .step(name)
                        .map(|s| s.skill.clone())
                        .unwrap_or_default();
                    self.audit.append(
                        AuditRecord::new(
                            job.org_id,
                            job.id,
                            name.as_str(),
                            skill,
                            AuditOutcome::Cancelled,
                        )
                        .with_chain(chain_id(job), 0),
                    )?;
                }
                self.finalize_cancelled(job)?;
                return Ok(DriveOutcome::Cancelled);
            }

            let ready = self.settle_and_collect_ready(job, definition)?;
            if !ready.is_empty() {
                for step_name in ready {
                    self.spawn_step(
                        job,
                        definition,
                        &step_name,
                        wave,
                        &mut join_set,
                        &mut in_flight,
                        &cancel_rx,
                    )?;
                }
                wave += 1;
            }
            self.jobs.save(job)?;

            if join_set.is_empty() {
                return if job.has_awaiting_approval() {
                    Ok(DriveOutcome::Parked)
                } else {
                    Ok(DriveOutcome::Finished)
                };
            }

            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped; treat as no-op and keep joining.
                        if let Some(joined) = join_set.join_next_with_id().await {
                            self.apply_joined(job, definition, joined, &mut in_flight)?;
                        }
                    }
                    // Loop top re-checks the flag.
                }
                Some(joined) = join_set.join_next_with_id() => {
                    self.apply_joined(job, definition, joined, &mut in_flight)?;
                    self.jobs.save(job)?;
                }
            }
        }
    }

    /// Cascade skip rules to a fixpoint, then return steps ready to spawn.
    fn settle_and_collect_ready(
        &self,
        job: &mut Job,
        definition: &SequenceDefinition,
    ) -> EngineResult<Vec<String>> {
        let mut ready = Vec::new();
        loop {
            let mut changed = false;
            for step_def in &definition.steps {
                let status = match job.step(&step_def.name) {
                    Some(s) => s.status,
                    None => continue,
                };
                if status != StepStatus::Pending {
                    continue;
                }

                let deps_terminal = step_def.depends_on.iter().all(|d| {
                    job.step(d).map_or(false, |s| s.status.is_terminal())
                });
                if !deps_terminal {
                    continue;
                }

                let failed_required_dep = step_def.depends_on.iter().find(|d| {
                    let dep_failed = job
                        .step(d)
                        .map_or(false, |s| s.status != StepStatus::Succeeded);
                    let dep_required = definition
                        .step(d)
                        .map_or(false, |dd| dd.criticality == Criticality::Required);
                    dep_failed && dep_required
                });

                if let Some(dep) = failed_required_dep {
                    let reason = format!("required dependency '{dep}' did not succeed");
                    if let Some(step) = job.step_mut(&step_def.name) {
                        step.mark_skipped(reason.clone());
                    }
                    self.audit.append(
                        AuditRecord::new(
                            job.org_id,
                            job.id,
                            step_def.name.as_str(),
                            step_def.skill.as_str(),
                            AuditOutcome::Skipped,
                        )
                        .with_error(reason)
                        .with_chain(chain_id(job), 0),
                    )?;
                    changed = true;
                    continue;
                }

                let all_deps_unusable = !step_def.depends_on.is_empty()
                    && step_def.depends_on.iter().all(|d| {
                        job.step(d)
                            .map_or(true, |s| s.status != StepStatus::Succeeded)
                    });
                if all_deps_unusable {
                    let reason = "all dependencies failed or were skipped".to_string();
                    if let Some(step) = job.step_mut(&step_def.name) {
                        step.mark_skipped(reason.clone());
                    }
                    self.audit.append(
                        AuditRecord::new(
                            job.org_id,
                            job.id,
                            step_def.name.as_str(),
                            step_def.skill.as_str(),
                            AuditOutcome::Skipped,
                        )
                        .with_error(reason)
                        .with_chain(chain_id(job), 0),
                    )?;
                    changed = true;
                    continue;
                }

                if !ready.contains(&step_def.name) {
                    ready.push(step_def.name.clone());
                }
            }
            if !changed {
                return Ok(ready);
            }
            // A new skip may have made further dependents' deps terminal.
            ready.clear();
        }
    }

    fn spawn_step(
        &self,
        job: &mut Job,
        definition: &SequenceDefinition,
        step_name: &str,
        wave: u32,
        join_set: &mut JoinSet<(String, u32, StepTaskResult)>,
        in_flight: &mut HashMap<tokio::task::Id, (String, u32)>,
        cancel_rx: &watch::Receiver<bool>,
    ) -> EngineResult<()> {
        let step_def = definition
            .step(step_name)
            .ok_or_else(|| EngineError::validation(format!("unknown step: {step_name}")))?
            .clone();
        let input = build_step_input(job, &step_def);

        if let Some(step) = job.step_mut(step_name) {
            step.mark_running(input.clone());
        }
        debug!(job_id = %job.id, step = %step_name, skill = %step_def.skill, wave, "step started");

        let skills = self.skills.clone();
        let budget = self.budget.clone();
        let semaphore = self.semaphore.clone();
        let principal = Principal::new(job.org_id, job.user_id);
        let retry_timed_out_required = self.config.retry_timed_out_required;
        let cancel = cancel_rx.clone();
        let name = step_name.to_string();

        let handle = join_set.spawn(async move {
            let result = execute_step(
                skills,
                budget,
                semaphore,
                step_def,
                input,
                principal,
                retry_timed_out_required,
                cancel,
            )
            .await;
            (name, wave, result)
        });
        in_flight.insert(handle.id(), (step_name.to_string(), wave));
        Ok(())
    }

    fn apply_joined(
        &self,
        job: &mut Job,
        definition: &SequenceDefinition,
        joined: Result<(tokio::task::Id, (String, u32, StepTaskResult)), tokio::task::JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, (String, u32)>,
    ) -> EngineResult<()> {
        let (step_name, wave, result) = match joined {
            Ok((task_id, output)) => {
                in_flight.remove(&task_id);
                output
            }
            // A panicking skill must fail its own step, not the drive loop:
            // attribute the dead task and let criticality propagation decide
            // the job's fate.
            Err(e) => {
                let Some((step_name, wave)) = in_flight.remove(&e.id()) else {
                    warn!(job_id = %job.id, error = %e, "joined a step task with no in-flight record");
                    return Ok(());
                };
                let result = if e.is_cancelled() {
                    StepTaskResult::Cancelled
                } else {
                    StepTaskResult::Failed {
                        error: EngineError::external(format!("skill panicked: {e}")),
                        attempts: 0,
                    }
                };
                (step_name, wave, result)
            }
        };

        let step_def = definition
            .step(&step_name)
            .ok_or_else(|| EngineError::validation(format!("unknown step: {step_name}")))?
            .clone();
        let criticality = step_def.criticality;
        let org_id = job.org_id;
        let job_id = job.id;
        let chain = chain_id(job);

        if job.step(&step_name).is_none() {
            return Ok(());
        }

        match result {
            StepTaskResult::Succeeded(output) => {
                let ms = {
                    let step = job.step_mut(&step_name).ok_or(EngineError::NotFound)?;
                    step.mark_succeeded(output.clone());
                    step.duration_ms.unwrap_or(0)
                };
                job.context.insert(step_name.clone(), output);
                self.bump(|s| s.steps_executed += 1);
                self.audit.append(
                    AuditRecord::new(
                        org_id,
                        job_id,
                        step_name.as_str(),
                        step_def.skill.as_str(),
                        AuditOutcome::Success,
                    )
                    .with_cost(step_def.cost_credits)
                        .with_execution_ms(ms)
                        .with_chain(chain, wave),
                )?;
                debug!(job_id = %job_id, step = %step_name, "step succeeded");
            }
            StepTaskResult::Drafted(drafted) => {
                if let Some(step) = job.step_mut(&step_name) {
                    step.mark_awaiting_approval(drafted.clone());
                }
                self.audit.append(
                    AuditRecord::new(
                        org_id,
                        job_id,
                        step_name.as_str(),
                        step_def.skill.as_str(),
                        AuditOutcome::Pending,
                    )
                    .with_chain(chain, wave),
                )?;
                self.publish(EngineNotification::ApprovalRequested {
                    job_id,
                    org_id,
                    step_name: step_name.clone(),
                    drafted_action: drafted,
                });
                info!(job_id = %job_id, step = %step_name, "step awaiting approval");
            }
            StepTaskResult::Failed { error, attempts } => {
                let ms = {
                    let step = job.step_mut(&step_name).ok_or(EngineError::NotFound)?;
                    if attempts > 0 {
                        step.attempt = attempts;
                    }
                    step.mark_failed(error.to_string());
                    step.duration_ms.unwrap_or(0)
                };
                self.bump(|s| s.steps_executed += 1);
                self.audit.append(
                    AuditRecord::new(
                        org_id,
                        job_id,
                        step_name.as_str(),
                        step_def.skill.as_str(),
                        AuditOutcome::Failed,
                    )
                    .with_error(error.to_string())
                    .with_execution_ms(ms)
                    .with_chain(chain, wave),
                )?;
                if criticality == Criticality::Required {
                    job.status = JobStatus::Failed;
                    warn!(job_id = %job_id, step = %step_name, error = %error,
                        "required step failed; job marked failed");
                } else {
                    debug!(job_id = %job_id, step = %step_name, error = %error,
                        "best-effort step failed; job continues");
                }
            }
            StepTaskResult::PolicyRejected(error) => {
                if let Some(step) = job.step_mut(&step_name) {
                    step.mark_failed(error.to_string());
                }
                self.audit.append(
                    AuditRecord::new(
                        org_id,
                        job_id,
                        step_name.as_str(),
                        step_def.skill.as_str(),
                        AuditOutcome::Failed,
                    )
                    .with_error(error.to_string())
                    .with_chain(chain, wave),
                )?;
                if criticality == Criticality::Required {
                    job.status = JobStatus::Failed;
                }
                info!(job_id = %job_id, step = %step_name, error = %error, "step policy-rejected");
            }
            StepTaskResult::Cancelled => {
                if let Some(step) = job.step_mut(&step_name) {
                    step.mark_cancelled();
                }
                self.audit.append(
                    AuditRecord::new(
                        org_id,
                        job_id,
                        step_name.as_str(),
                        step_def.skill.as_str(),
                        AuditOutcome::Cancelled,
                    )
                    .with_chain(chain, wave),
                )?;
            }
        }
        job.touch();
        Ok(())
    }

    // ── Finalization & chaining ─────────────────────────────────────────

    fn finalize(
        &self,
        job: &mut Job,
        definition: &SequenceDefinition,
    ) -> EngineResult<Vec<TriggerEvent>> {
        let status = if job.status == JobStatus::Running {
            job.derive_terminal_status(definition)
        } else {
            job.status
        };
        job.mark_finished(status);
        self.jobs.save(job)?;
        if let Some(key) = &job.idempotency_key {
            self.guard.mark_terminal(key)?;
        }

        match status {
            JobStatus::Completed => {
                self.bump(|s| s.jobs_completed += 1);
                self.publish(EngineNotification::JobCompleted {
                    job_id: job.id,
                    org_id: job.org_id,
                });
                info!(job_id = %job.id, "job completed");
            }
            JobStatus::Failed => {
                self.bump(|s| s.jobs_failed += 1);
                let error = job
                    .steps
                    .iter()
                    .find_map(|s| s.error.clone())
                    .unwrap_or_else(|| "required step failed".to_string());
                self.publish(EngineNotification::JobFailed {
                    job_id: job.id,
                    org_id: job.org_id,
                    error,
                });
                info!(job_id = %job.id, "job failed");
            }
            _ => {}
        }

        Ok(self.chain_events(job, definition, status))
    }

    fn finalize_cancelled(&self, job: &mut Job) -> EngineResult<()> {
        job.mark_finished(JobStatus::Cancelled);
        self.jobs.save(job)?;
        if let Some(key) = &job.idempotency_key {
            self.guard.mark_terminal(key)?;
        }
        self.bump(|s| s.jobs_cancelled += 1);
        self.publish(EngineNotification::JobCancelled {
            job_id: job.id,
            org_id: job.org_id,
        });
        info!(job_id = %job.id, "job cancelled");
        Ok(())
    }

    /// Follow-on events declared by the sequence, depth-capped.
    fn chain_events(
        &self,
        job: &Job,
        definition: &SequenceDefinition,
        status: JobStatus,
    ) -> Vec<TriggerEvent> {
        let mut events = Vec::new();
        for rule in &definition.chain_into {
            if rule.when == ChainWhen::OnSuccess && status != JobStatus::Completed {
                continue;
            }
            let child_depth = job.chain.depth + 1;
            if child_depth > self.config.max_chain_depth {
                warn!(job_id = %job.id, depth = child_depth,
                    max = self.config.max_chain_depth, "chain depth cap reached; follow-on suppressed");
                self.bump(|s| s.chains_suppressed += 1);
                self.publish(EngineNotification::ChainSuppressed {
                    job_id: job.id,
                    org_id: job.org_id,
                    depth: child_depth,
                    max_depth: self.config.max_chain_depth,
                });
                continue;
            }
            let payload = json!({
                "trigger": job.trigger_payload,
                "context": JsonValue::Object(job.context.clone()),
                "source_job_id": job.id.to_string(),
            });
            events.push(
                TriggerEvent::new(rule.emit_event_type.clone(), job.org_id, payload).with_chain(
                    ChainContext {
                        parent_job_id: job.id,
                        depth: job.chain.depth,
                    },
                ),
            );
        }
        events
    }

    // ── Plumbing ────────────────────────────────────────────────────────

    fn drive_lock(&self, job_id: JobId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.drive_locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(job_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop a terminal job's drive lock entry. Holders of an already-cloned
    /// Arc keep serializing among themselves; a fresh entry is only ever
    /// created for a job that drive_to_rest will short-circuit on.
    fn discard_drive_lock(&self, job_id: JobId) {
        let mut locks = match self.drive_locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.remove(&job_id);
    }

    /// Jobs with live per-job scheduling state (running or parked). Terminal
    /// jobs are evicted, so this stays bounded by open work.
    pub fn tracked_job_count(&self) -> usize {
        match self.drive_locks.lock() {
            Ok(l) => l.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn register_cancel(&self, job_id: JobId) -> EngineResult<watch::Receiver<bool>> {
        let (tx, rx) = watch::channel(false);
        self.cancel_senders
            .lock()
            .map_err(|e| EngineError::storage(e.to_string()))?
            .insert(job_id, tx);
        Ok(rx)
    }

    fn unregister_cancel(&self, job_id: JobId) {
        if let Ok(mut senders) = self.cancel_senders.lock() {
            senders.remove(&job_id);
        }
    }

    fn publish(&self, notification: EngineNotification) {
        if let Err(e) = self.bus.publish(notification) {
            // State is already persisted; a lost notification is degraded
            // observability, not lost work.
            warn!(error = ?e, "failed to publish engine notification");
        }
    }

    fn bump(&self, f: impl FnOnce(&mut SchedulerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

}

// ── Step task ───────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn execute_step(
    skills: Arc<SkillRegistry>,
    budget: Arc<dyn BudgetService>,
    semaphore: Arc<Semaphore>,
    step_def: StepDefinition,
    input: JsonValue,
    principal: Principal,
    retry_timed_out_required: bool,
    mut cancel: watch::Receiver<bool>,
) -> StepTaskResult {
    let _permit = match semaphore.acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            return StepTaskResult::Failed {
                error: EngineError::storage("worker pool closed"),
                attempts: 0,
            };
        }
    };
    if *cancel.borrow() {
        return StepTaskResult::Cancelled;
    }

    let invoker = match skills.get(&step_def.skill) {
        Ok(i) => i,
        Err(error) => return StepTaskResult::Failed { error, attempts: 0 },
    };

    if step_def.cost_credits > 0 {
        match budget.check(principal.org_id, step_def.cost_credits).await {
            Ok(decision) if !decision.allowed => {
                return StepTaskResult::PolicyRejected(EngineError::policy(format!(
                    "budget cap exceeded: {}/{} credits",
                    decision.spent, decision.cap
                )));
            }
            Ok(_) => {}
            Err(error) => return StepTaskResult::Failed { error, attempts: 0 },
        }
    }

    let mut attempts: u32 = 0;
    loop {
        attempts += 1;

        let outcome = tokio::select! {
            _ = cancel.changed() => return StepTaskResult::Cancelled,
            res = tokio::time::timeout(step_def.timeout, invoker.invoke(&input, principal)) => res,
        };

        match outcome {
            Ok(Ok(output)) => {
                if step_def.cost_credits > 0 {
                    if let Err(e) = budget
                        .record_spend(principal.org_id, step_def.cost_credits)
                        .await
                    {
                        warn!(skill = %step_def.skill, error = %e, "failed to record spend");
                    }
                }
                return if step_def.requires_approval {
                    StepTaskResult::Drafted(output)
                } else {
                    StepTaskResult::Succeeded(output)
                };
            }
            Ok(Err(error)) if error.is_policy() => {
                return StepTaskResult::PolicyRejected(error);
            }
            Ok(Err(error)) => {
                if step_def.retry.allows_retry(attempts) {
                    debug!(skill = %step_def.skill, attempt = attempts, error = %error, "retrying step");
                    if backoff(&step_def, attempts, &mut cancel).await {
                        return StepTaskResult::Cancelled;
                    }
                    continue;
                }
                return StepTaskResult::Failed { error, attempts };
            }
            Err(_elapsed) => {
                let error = EngineError::Timeout {
                    step: step_def.name.clone(),
                    timeout_ms: step_def.timeout.as_millis() as u64,
                };
                let timeout_retryable = match step_def.criticality {
                    Criticality::BestEffort => true,
                    Criticality::Required => retry_timed_out_required,
                };
                if timeout_retryable && step_def.retry.allows_retry(attempts) {
                    debug!(skill = %step_def.skill, attempt = attempts, "retrying after timeout");
                    if backoff(&step_def, attempts, &mut cancel).await {
                        return StepTaskResult::Cancelled;
                    }
                    continue;
                }
                return StepTaskResult::Failed { error, attempts };
            }
        }
    }
}

/// Sleep out the retry backoff; true if cancelled while waiting.
async fn backoff(step_def: &StepDefinition, attempts: u32, cancel: &mut watch::Receiver<bool>) -> bool {
    let delay = step_def.retry.delay_for_attempt(attempts);
    tokio::select! {
        _ = cancel.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

/// Input handed to a step's skill: the trigger payload, the outputs of its
/// dependencies (absent entries for failed/skipped best-effort deps), and
/// the step's static params.
fn build_step_input(job: &Job, step_def: &StepDefinition) -> JsonValue {
    let mut deps = Map::new();
    for dep in &step_def.depends_on {
        if let Some(output) = job.context.get(dep) {
            deps.insert(dep.clone(), output.clone());
        }
    }
    json!({
        "trigger": job.trigger_payload,
        "context": JsonValue::Object(deps),
        "params": step_def.input_template.clone().unwrap_or(JsonValue::Null),
    })
}

/// Chain link recorded on audit rows: the parent for chained jobs, the job
/// itself at the chain root.
fn chain_id(job: &Job) -> JobId {
    job.chain.parent_job_id.unwrap_or(job.id)
}

/// Resolve a dotted path against the payload.
fn payload_lookup<'a>(payload: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn ambient_user(payload: &JsonValue) -> Option<UserId> {
    payload_lookup(payload, "user_id")
        .and_then(JsonValue::as_str)
        .and_then(|s| s.parse().ok())
}

/// Check a sequence's declared context requirements against the trigger
/// payload and the ambient principal.
fn validate_context(
    definition: &SequenceDefinition,
    event: &TriggerEvent,
    principal: Principal,
) -> EngineResult<()> {
    for requirement in &definition.context_requirements {
        let satisfied = match requirement.as_str() {
            "org_id" => true,
            "user_id" => principal.user_id.is_some(),
            path => payload_lookup(&event.payload, path).map_or(false, |v| !v.is_null()),
        };
        if !satisfied {
            return Err(EngineError::validation(format!(
                "missing context requirement: {requirement}"
            )));
        }
    }
    Ok(())
}
