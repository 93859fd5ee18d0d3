//! End-to-end scheduler flows: routing, execution, criticality, approvals,
//! dedup, chaining, and cancellation against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use flowforge_core::{EngineResult, OrgId, Principal};
use flowforge_engine::{
    BudgetDecision, BudgetService, Decision, InMemoryAuditLog, InMemoryIdempotencyGuard,
    InMemoryJobStore, JobScheduler, JobStatus, JobStore, SchedulerConfig, SkillInvoker,
    SkillRegistry, StepStatus, UnlimitedBudget,
};
use flowforge_engine::{AuditLog, AuditOutcome};
use flowforge_events::{EngineNotification, EventBus, InMemoryEventBus, Subscription, TriggerEvent};
use flowforge_routing::{InMemoryRuleStore, RoutingRule, RuleScope, RuleStore};
use flowforge_sequence::{
    ChainRule, InMemorySequenceRegistry, SequenceDefinition, SequenceRegistry, StepDefinition,
};

type TestScheduler = JobScheduler<InMemoryEventBus<EngineNotification>>;

struct Harness {
    scheduler: Arc<TestScheduler>,
    jobs: Arc<InMemoryJobStore>,
    audit: Arc<InMemoryAuditLog>,
    rules: Arc<InMemoryRuleStore>,
    registry: Arc<InMemorySequenceRegistry>,
    skills: Arc<SkillRegistry>,
    notifications: Subscription<EngineNotification>,
}

fn harness(config: SchedulerConfig) -> Harness {
    harness_with_budget(config, Arc::new(UnlimitedBudget))
}

fn harness_with_budget(config: SchedulerConfig, budget: Arc<dyn BudgetService>) -> Harness {
    let rules = Arc::new(InMemoryRuleStore::new());
    let registry = Arc::new(InMemorySequenceRegistry::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let guard = Arc::new(InMemoryIdempotencyGuard::new());
    let skills = Arc::new(SkillRegistry::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let notifications = bus.subscribe();

    let scheduler = Arc::new(
        JobScheduler::new(
            rules.clone(),
            registry.clone(),
            jobs.clone(),
            guard,
            skills.clone(),
            budget,
            audit.clone(),
            bus,
        )
        .with_config(config),
    );

    Harness {
        scheduler,
        jobs,
        audit,
        rules,
        registry,
        skills,
        notifications,
    }
}

fn route(h: &Harness, org: OrgId, event_type: &str, sequence_key: &str) {
    h.rules
        .upsert(RoutingRule::new(RuleScope::org(org), event_type, sequence_key))
        .unwrap();
}

struct SlowSkill(Duration);

#[async_trait]
impl SkillInvoker for SlowSkill {
    async fn invoke(&self, _input: &JsonValue, _principal: Principal) -> EngineResult<JsonValue> {
        tokio::time::sleep(self.0).await;
        Ok(json!({"late": true}))
    }
}

struct ExhaustedBudget;

#[async_trait]
impl BudgetService for ExhaustedBudget {
    async fn check(&self, _org_id: OrgId, _credits: u32) -> EngineResult<BudgetDecision> {
        Ok(BudgetDecision {
            allowed: false,
            spent: 100,
            cap: 100,
        })
    }

    async fn record_spend(&self, _org_id: OrgId, _credits: u32) -> EngineResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn best_effort_timeout_still_completes_the_job() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "meeting_debrief",
            1,
            vec![
                StepDefinition::new("summarize", "crm.summarize"),
                StepDefinition::new("draft_followup", "email.draft")
                    .depends_on(&["summarize"])
                    .best_effort()
                    .with_timeout(Duration::from_millis(50)),
            ],
        ))
        .unwrap();
    route(&h, org, "meeting_ended", "meeting_debrief");

    h.skills
        .register_fn("crm.summarize", |_input, _p| Ok(json!({"summary": "ok"})));
    h.skills
        .register("email.draft", Arc::new(SlowSkill(Duration::from_millis(500))));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("meeting_ended", org, json!({"meeting_id": "M1"})))
        .await
        .unwrap();
    assert_eq!(outcome.job_ids.len(), 1);

    let job = h.jobs.get(outcome.job_ids[0]).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.step("summarize").unwrap().status, StepStatus::Succeeded);

    let failed = job.step("draft_followup").unwrap();
    assert_eq!(failed.status, StepStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("timed out"));

    // Both attempts are in the audit trail regardless of outcome.
    let records = h.audit.for_job(job.id).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r.outcome == AuditOutcome::Failed));
}

#[tokio::test]
async fn required_failure_fails_job_and_skips_dependents() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "enrich_and_notify",
            1,
            vec![
                StepDefinition::new("enrich", "data.enrich"),
                StepDefinition::new("notify", "slack.notify").depends_on(&["enrich"]),
                StepDefinition::new("log", "audit.log").best_effort(),
            ],
        ))
        .unwrap();
    route(&h, org, "contact_created", "enrich_and_notify");

    h.skills.register_fn("data.enrich", |_input, _p| {
        Err(flowforge_core::EngineError::external("upstream 500"))
    });
    h.skills.register_fn("slack.notify", |_input, _p| Ok(json!({})));
    h.skills.register_fn("audit.log", |_input, _p| Ok(json!({})));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("contact_created", org, json!({})))
        .await
        .unwrap();

    let job = h.jobs.get(outcome.job_ids[0]).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.step("enrich").unwrap().status, StepStatus::Failed);
    assert_eq!(job.step("notify").unwrap().status, StepStatus::Skipped);
    // Independent branch still ran.
    assert_eq!(job.step("log").unwrap().status, StepStatus::Succeeded);
}

#[tokio::test]
async fn step_input_carries_trigger_and_dependency_outputs() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "pipeline",
            1,
            vec![
                StepDefinition::new("first", "s.first"),
                StepDefinition::new("second", "s.second")
                    .depends_on(&["first"])
                    .with_input(json!({"mode": "fast"})),
            ],
        ))
        .unwrap();
    route(&h, org, "tick", "pipeline");

    h.skills.register_fn("s.first", |input, _p| {
        assert_eq!(input["trigger"]["n"], json!(7));
        Ok(json!({"doubled": 14}))
    });
    h.skills.register_fn("s.second", |input, _p| {
        assert_eq!(input["context"]["first"]["doubled"], json!(14));
        assert_eq!(input["params"]["mode"], json!("fast"));
        Ok(json!({}))
    });

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("tick", org, json!({"n": 7})))
        .await
        .unwrap();
    let job = h.jobs.get(outcome.job_ids[0]).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_duplicate_events_create_exactly_one_job() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "email_triage",
            1,
            vec![StepDefinition::new("classify", "email.classify")],
        ))
        .unwrap();
    route(&h, org, "email_received", "email_triage");
    h.skills
        .register_fn("email.classify", |_input, _p| Ok(json!({"label": "sales"})));

    let event = || {
        TriggerEvent::new("email_received", org, json!({"subject": "hi"}))
            .with_source_id("E1")
    };

    let a = tokio::spawn({
        let s = h.scheduler.clone();
        let e = event();
        async move { s.handle_event(e).await.unwrap() }
    });
    let b = tokio::spawn({
        let s = h.scheduler.clone();
        let e = event();
        async move { s.handle_event(e).await.unwrap() }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    let total_jobs = a.job_ids.len() + b.job_ids.len();
    assert_eq!(total_jobs, 1);
    assert!(a.absorbed || b.absorbed);

    // A third duplicate inside the window is absorbed and names the winner.
    let c = h.scheduler.handle_event(event()).await.unwrap();
    assert!(c.absorbed);
    let winner = a.job_ids.first().or(b.job_ids.first()).copied().unwrap();
    assert_eq!(c.existing_job_id, Some(winner));
}

#[tokio::test]
async fn approval_gate_parks_job_until_approved() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "outreach",
            1,
            vec![
                StepDefinition::new("draft", "email.draft").with_approval(),
                StepDefinition::new("send", "email.send").depends_on(&["draft"]),
            ],
        ))
        .unwrap();
    route(&h, org, "lead_created", "outreach");

    h.skills
        .register_fn("email.draft", |_input, _p| Ok(json!({"body": "hello"})));
    h.skills.register_fn("email.send", |input, _p| {
        assert_eq!(input["context"]["draft"]["body"], json!("hello"));
        Ok(json!({"sent": true}))
    });

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("lead_created", org, json!({})))
        .await
        .unwrap();
    let job_id = outcome.job_ids[0];

    let parked = h.jobs.get(job_id).unwrap().unwrap();
    assert_eq!(parked.status, JobStatus::Running);
    assert_eq!(parked.step("draft").unwrap().status, StepStatus::AwaitingApproval);
    assert_eq!(parked.step("send").unwrap().status, StepStatus::Pending);

    let requested = h.notifications.drain();
    assert!(requested.iter().any(|n| matches!(
        n,
        EngineNotification::ApprovalRequested { step_name, .. } if step_name == "draft"
    )));

    let status = h
        .scheduler
        .resolve_approval(job_id, "draft", Decision::Approve)
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Succeeded);

    let done = h.jobs.get(job_id).unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.step("send").unwrap().status, StepStatus::Succeeded);

    // Deciding again is a no-op, not an error.
    let again = h
        .scheduler
        .resolve_approval(job_id, "draft", Decision::Reject)
        .await
        .unwrap();
    assert_eq!(again, StepStatus::Succeeded);
    assert_eq!(h.jobs.get(job_id).unwrap().unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn rejecting_a_required_step_fails_the_job() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "outreach",
            1,
            vec![
                StepDefinition::new("draft", "email.draft").with_approval(),
                StepDefinition::new("send", "email.send").depends_on(&["draft"]),
            ],
        ))
        .unwrap();
    route(&h, org, "lead_created", "outreach");
    h.skills
        .register_fn("email.draft", |_input, _p| Ok(json!({"body": "hello"})));
    h.skills.register_fn("email.send", |_input, _p| Ok(json!({})));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("lead_created", org, json!({})))
        .await
        .unwrap();
    let job_id = outcome.job_ids[0];

    let status = h
        .scheduler
        .resolve_approval(job_id, "draft", Decision::Reject)
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Failed);

    let job = h.jobs.get(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.step("send").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn chains_follow_on_events_and_caps_depth() {
    let h = harness(SchedulerConfig::default().with_max_chain_depth(2));
    let org = OrgId::new();

    h.registry
        .publish(
            SequenceDefinition::new(
                "relay",
                1,
                vec![StepDefinition::new("hop", "relay.hop")],
            )
            .chaining(vec![ChainRule::on_success("relay_done")]),
        )
        .unwrap();
    route(&h, org, "relay_start", "relay");
    route(&h, org, "relay_done", "relay");
    h.skills.register_fn("relay.hop", |_input, _p| Ok(json!({})));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("relay_start", org, json!({})))
        .await
        .unwrap();

    // Depths 0, 1, 2 run; depth 3 is suppressed.
    assert_eq!(outcome.job_ids.len(), 3);
    for (i, job_id) in outcome.job_ids.iter().enumerate() {
        let job = h.jobs.get(*job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.chain.depth, i as u32);
    }

    let root = h.jobs.get(outcome.job_ids[0]).unwrap().unwrap();
    assert_eq!(root.chain.child_job_ids, vec![outcome.job_ids[1]]);

    let suppressed = h
        .notifications
        .drain()
        .into_iter()
        .filter(|n| matches!(n, EngineNotification::ChainSuppressed { depth: 3, .. }))
        .count();
    assert_eq!(suppressed, 1);
    assert_eq!(h.scheduler.stats().chains_suppressed, 1);
}

#[tokio::test]
async fn unrouted_events_create_nothing() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("unknown_event", org, json!({})).with_source_id("X1"))
        .await
        .unwrap();
    assert!(outcome.job_ids.is_empty());
    assert!(!outcome.absorbed);
    assert_eq!(h.scheduler.stats().events_unrouted, 1);

    // The dedup key was released, so a later rule change lets the same
    // event through.
    h.registry
        .publish(SequenceDefinition::new(
            "late",
            1,
            vec![StepDefinition::new("only", "s.only")],
        ))
        .unwrap();
    route(&h, org, "unknown_event", "late");
    h.skills.register_fn("s.only", |_input, _p| Ok(json!({})));

    let retry = h
        .scheduler
        .handle_event(TriggerEvent::new("unknown_event", org, json!({})).with_source_id("X1"))
        .await
        .unwrap();
    assert_eq!(retry.job_ids.len(), 1);
}

#[tokio::test]
async fn missing_context_requirement_rejects_before_any_step() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(
            SequenceDefinition::new(
                "debrief",
                1,
                vec![StepDefinition::new("summarize", "crm.summarize")],
            )
            .requiring(&["meeting.id"]),
        )
        .unwrap();
    route(&h, org, "meeting_ended", "debrief");
    h.skills
        .register_fn("crm.summarize", |_input, _p| Ok(json!({})));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("meeting_ended", org, json!({"other": 1})))
        .await
        .unwrap();
    assert!(outcome.job_ids.is_empty());
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].0, "debrief");
    assert!(outcome.rejected[0].1.contains("meeting.id"));
}

#[tokio::test]
async fn budget_veto_is_a_policy_rejection() {
    let h = harness_with_budget(SchedulerConfig::default(), Arc::new(ExhaustedBudget));
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "costly",
            1,
            vec![StepDefinition::new("spend", "ai.generate").with_cost(5)],
        ))
        .unwrap();
    route(&h, org, "tick", "costly");
    h.skills.register_fn("ai.generate", |_input, _p| Ok(json!({})));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("tick", org, json!({})))
        .await
        .unwrap();

    let job = h.jobs.get(outcome.job_ids[0]).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let step = job.step("spend").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("budget cap exceeded"));
}

#[tokio::test]
async fn retries_exhaust_then_fail_with_attempt_count() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "flaky",
            1,
            vec![
                StepDefinition::new("wobble", "s.wobble")
                    .best_effort()
                    .with_retry(flowforge_sequence::RetryPolicy::fixed(
                        3,
                        Duration::from_millis(1),
                    )),
            ],
        ))
        .unwrap();
    route(&h, org, "tick", "flaky");

    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    h.skills.register_fn("s.wobble", move |_input, _p| {
        seen.fetch_add(1, Ordering::SeqCst);
        Err(flowforge_core::EngineError::external("still down"))
    });

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("tick", org, json!({})))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let job = h.jobs.get(outcome.job_ids[0]).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.step("wobble").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn cancelling_a_parked_job_finalizes_it() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "outreach",
            1,
            vec![
                StepDefinition::new("draft", "email.draft").with_approval(),
                StepDefinition::new("send", "email.send").depends_on(&["draft"]),
            ],
        ))
        .unwrap();
    route(&h, org, "lead_created", "outreach");
    h.skills
        .register_fn("email.draft", |_input, _p| Ok(json!({"body": "hello"})));
    h.skills.register_fn("email.send", |_input, _p| Ok(json!({})));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("lead_created", org, json!({})))
        .await
        .unwrap();
    let job_id = outcome.job_ids[0];

    h.scheduler.cancel_job(job_id).await.unwrap();

    let job = h.jobs.get(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.steps.iter().all(|s| s.status.is_terminal()));
    assert!(
        h.notifications
            .drain()
            .iter()
            .any(|n| matches!(n, EngineNotification::JobCancelled { .. }))
    );

    // A decision arriving after cancellation is a no-op.
    let status = h
        .scheduler
        .resolve_approval(job_id, "draft", Decision::Approve)
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Cancelled);
}

#[tokio::test]
async fn jobs_pin_the_version_they_started_with() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "evolving",
            1,
            vec![StepDefinition::new("only", "s.only")],
        ))
        .unwrap();
    route(&h, org, "tick", "evolving");
    h.skills.register_fn("s.only", |_input, _p| Ok(json!({})));

    let first = h
        .scheduler
        .handle_event(TriggerEvent::new("tick", org, json!({})))
        .await
        .unwrap();

    h.registry
        .publish(SequenceDefinition::new(
            "evolving",
            2,
            vec![
                StepDefinition::new("only", "s.only"),
                StepDefinition::new("extra", "s.only"),
            ],
        ))
        .unwrap();

    let second = h
        .scheduler
        .handle_event(TriggerEvent::new("tick", org, json!({})))
        .await
        .unwrap();

    assert_eq!(h.jobs.get(first.job_ids[0]).unwrap().unwrap().version, 1);
    let new_job = h.jobs.get(second.job_ids[0]).unwrap().unwrap();
    assert_eq!(new_job.version, 2);
    assert_eq!(new_job.steps.len(), 2);
}

#[tokio::test]
async fn panicking_skill_fails_the_job_instead_of_stranding_it() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "volatile",
            1,
            vec![
                StepDefinition::new("explode", "s.explode"),
                StepDefinition::new("after", "s.after").depends_on(&["explode"]),
            ],
        ))
        .unwrap();
    route(&h, org, "tick", "volatile");
    h.skills
        .register_fn("s.explode", |_input, _p| -> EngineResult<JsonValue> {
            panic!("skill blew up")
        });
    h.skills.register_fn("s.after", |_input, _p| Ok(json!({})));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("tick", org, json!({})).with_source_id("T1"))
        .await
        .unwrap();
    assert_eq!(outcome.job_ids.len(), 1);

    // The panic fails its own step; the job still reaches a terminal state.
    let job = h.jobs.get(outcome.job_ids[0]).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let exploded = job.step("explode").unwrap();
    assert_eq!(exploded.status, StepStatus::Failed);
    assert!(exploded.error.as_deref().unwrap().contains("panicked"));
    assert_eq!(job.step("after").unwrap().status, StepStatus::Skipped);

    assert!(h
        .notifications
        .drain()
        .iter()
        .any(|n| matches!(n, EngineNotification::JobFailed { .. })));

    // The dedup key was bound and marked terminal, so a duplicate points at
    // the failed job rather than vanishing into a stuck one.
    let retry = h
        .scheduler
        .handle_event(TriggerEvent::new("tick", org, json!({})).with_source_id("T1"))
        .await
        .unwrap();
    assert!(retry.absorbed);
    assert_eq!(retry.existing_job_id, Some(outcome.job_ids[0]));

    assert!(h
        .jobs
        .list_by_status(None, Some(JobStatus::Running))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn per_job_scheduling_state_is_dropped_once_terminal() {
    let h = harness(SchedulerConfig::default());
    let org = OrgId::new();

    h.registry
        .publish(SequenceDefinition::new(
            "outreach",
            1,
            vec![StepDefinition::new("draft", "email.draft").with_approval()],
        ))
        .unwrap();
    route(&h, org, "lead_created", "outreach");
    h.skills
        .register_fn("email.draft", |_input, _p| Ok(json!({"body": "hi"})));

    let outcome = h
        .scheduler
        .handle_event(TriggerEvent::new("lead_created", org, json!({})))
        .await
        .unwrap();
    let job_id = outcome.job_ids[0];

    // Parked jobs keep their drive state until resolved.
    assert_eq!(h.scheduler.tracked_job_count(), 1);

    h.scheduler
        .resolve_approval(job_id, "draft", Decision::Approve)
        .await
        .unwrap();
    assert_eq!(h.scheduler.tracked_job_count(), 0);

    // Late decisions or cancels on the finished job do not re-accrete state.
    h.scheduler
        .resolve_approval(job_id, "draft", Decision::Reject)
        .await
        .unwrap();
    h.scheduler.cancel_job(job_id).await.unwrap();
    assert_eq!(h.scheduler.tracked_job_count(), 0);
}
