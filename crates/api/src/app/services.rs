//! Service wiring: in-memory stores, the scheduler, and the inbox engine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use flowforge_core::{JobId, OrgId};
use flowforge_engine::{
    AuditLog, InMemoryAuditLog, InMemoryIdempotencyGuard, InMemoryJobStore, JobScheduler,
    JobStore, SchedulerConfig, SkillRegistry, UnlimitedBudget,
};
use flowforge_events::{EngineNotification, EventBus, InMemoryEventBus, Subscription};
use flowforge_inbox::{
    AlwaysRelevant, InMemoryInboxStore, InboxStore, NoEnrichment, PrioritizationEngine,
    PriorityFactors, RawAgentOutput,
};
use flowforge_routing::{InMemoryRuleStore, RoutingRule, RuleScope, RuleStore};
use flowforge_sequence::{
    InMemorySequenceRegistry, SequenceDefinition, SequenceRegistry, StepDefinition,
};

pub type AppScheduler = JobScheduler<InMemoryEventBus<EngineNotification>>;

pub struct AppServices {
    pub scheduler: Arc<AppScheduler>,
    pub jobs: Arc<dyn JobStore>,
    pub audit: Arc<dyn AuditLog>,
    pub rules: Arc<dyn RuleStore>,
    pub registry: Arc<dyn SequenceRegistry>,
    pub inbox: Arc<PrioritizationEngine>,
    pub inbox_store: Arc<dyn InboxStore>,
}

/// How often the consumer polls its subscription for new notifications.
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How often the inbox sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);
/// Items older than this with a resolved underlying condition get swept.
const SWEEP_STALENESS: Duration = Duration::from_secs(7 * 24 * 3600);

/// Wire everything with in-memory backends and a couple of demo skills so a
/// fresh process answers `POST /events` meaningfully.
///
/// Spawns the inbox consumer and sweep tasks; call from within a tokio
/// runtime.
pub fn build_services() -> AppServices {
    let rules = Arc::new(InMemoryRuleStore::new());
    let registry = Arc::new(InMemorySequenceRegistry::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let guard = Arc::new(InMemoryIdempotencyGuard::new());
    let skills = Arc::new(SkillRegistry::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let notifications = bus.subscribe();

    register_demo_skills(&skills);
    seed_demo_routes(rules.as_ref(), registry.as_ref());

    let scheduler = Arc::new(
        JobScheduler::new(
            rules.clone(),
            registry.clone(),
            jobs.clone(),
            guard,
            skills,
            Arc::new(UnlimitedBudget),
            audit.clone(),
            bus,
        )
        .with_config(SchedulerConfig::default()),
    );

    let inbox_store = Arc::new(InMemoryInboxStore::new());
    let inbox = Arc::new(PrioritizationEngine::new(
        inbox_store.clone(),
        Arc::new(NoEnrichment),
        Arc::new(AlwaysRelevant),
    ));

    spawn_job_output_consumer(notifications, inbox.clone(), jobs.clone());
    spawn_sweep_timer(inbox.clone());

    AppServices {
        scheduler,
        jobs,
        audit,
        rules,
        registry,
        inbox,
        inbox_store,
    }
}

/// Feed completed jobs into the prioritization engine: every
/// `JobCompleted` notification becomes a scored, enriched inbox item.
fn spawn_job_output_consumer(
    notifications: Subscription<EngineNotification>,
    inbox: Arc<PrioritizationEngine>,
    jobs: Arc<dyn JobStore>,
) {
    tokio::spawn(async move {
        loop {
            for notification in notifications.drain() {
                if let EngineNotification::JobCompleted { job_id, org_id } = notification {
                    if let Err(e) = intake_job_output(&inbox, jobs.as_ref(), job_id, org_id).await
                    {
                        warn!(job_id = %job_id, error = %e, "failed to intake job output");
                    }
                }
            }
            tokio::time::sleep(CONSUMER_POLL_INTERVAL).await;
        }
    });
}

async fn intake_job_output(
    inbox: &PrioritizationEngine,
    jobs: &dyn JobStore,
    job_id: JobId,
    org_id: OrgId,
) -> Result<(), String> {
    let job = jobs
        .get(job_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("job {job_id} not found"))?;

    let item = inbox
        .intake(RawAgentOutput {
            org_id,
            source_agent: "job_scheduler".to_string(),
            item_type: job.sequence_key.clone(),
            title: format!("{} finished", job.sequence_key),
            payload: json!({
                "job_id": job.id.to_string(),
                "trigger": job.trigger_payload,
                "context": serde_json::Value::Object(job.context.clone()),
            }),
            source_job_id: Some(job.id),
            factors: PriorityFactors::default(),
            confidence: 1.0,
        })
        .map_err(|e| e.to_string())?;
    inbox
        .run_enrichment(item.id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Periodic inbox sweep: auto-resolve stale items, re-score the rest.
fn spawn_sweep_timer(inbox: Arc<PrioritizationEngine>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if let Err(e) = inbox.sweep(SWEEP_STALENESS, chrono::Utc::now()).await {
                warn!(error = %e, "inbox sweep failed");
            }
        }
    });
}

fn register_demo_skills(skills: &SkillRegistry) {
    skills.register_fn("demo.echo", |input, _principal| Ok(input.clone()));
    skills.register_fn("demo.timestamp", |_input, _principal| {
        Ok(json!({"at": chrono::Utc::now().to_rfc3339()}))
    });
}

fn seed_demo_routes(rules: &dyn RuleStore, registry: &dyn SequenceRegistry) {
    let demo = SequenceDefinition::new(
        "demo_echo",
        1,
        vec![
            StepDefinition::new("echo", "demo.echo"),
            StepDefinition::new("stamp", "demo.timestamp").depends_on(&["echo"]),
        ],
    );
    if registry.publish(demo).is_ok() {
        let _ = rules.upsert(RoutingRule::new(RuleScope::Global, "demo_echo", "demo_echo"));
        info!("demo route seeded: demo_echo -> demo_echo@v1");
    }
}
