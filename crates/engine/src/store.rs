//! Job storage.
//!
//! Each job is driven by exactly one task at a time (the scheduler's drive
//! loop, or a resume after an approval decision), so whole-job saves are
//! race-free per job. The store only has to be safe for concurrent writers
//! on *distinct* jobs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use flowforge_core::{EngineError, EngineResult, JobId, OrgId};

use crate::job::{Job, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert a new job. Rejects duplicate ids.
    fn insert(&self, job: Job) -> EngineResult<()>;

    fn get(&self, job_id: JobId) -> EngineResult<Option<Job>>;

    /// Persist the current state of a job (steps included).
    fn save(&self, job: &Job) -> EngineResult<()>;

    /// Record a chain child on the parent job.
    fn record_child(&self, parent: JobId, child: JobId) -> EngineResult<()>;

    fn list_by_status(
        &self,
        org_id: Option<OrgId>,
        status: Option<JobStatus>,
    ) -> EngineResult<Vec<Job>>;
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn insert(&self, job: Job) -> EngineResult<()> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> EngineResult<Option<Job>> {
        (**self).get(job_id)
    }

    fn save(&self, job: &Job) -> EngineResult<()> {
        (**self).save(job)
    }

    fn record_child(&self, parent: JobId, child: JobId) -> EngineResult<()> {
        (**self).record_child(parent, child)
    }

    fn list_by_status(
        &self,
        org_id: Option<OrgId>,
        status: Option<JobStatus>,
    ) -> EngineResult<Vec<Job>> {
        (**self).list_by_status(org_id, status)
    }
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> EngineResult<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        if jobs.contains_key(&job.id) {
            return Err(EngineError::conflict(format!("job already exists: {}", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    fn get(&self, job_id: JobId) -> EngineResult<Option<Job>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn save(&self, job: &Job) -> EngineResult<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        if !jobs.contains_key(&job.id) {
            return Err(EngineError::NotFound);
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn record_child(&self, parent: JobId, child: JobId) -> EngineResult<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        let job = jobs.get_mut(&parent).ok_or(EngineError::NotFound)?;
        if !job.chain.child_job_ids.contains(&child) {
            job.chain.child_job_ids.push(child);
            job.touch();
        }
        Ok(())
    }

    fn list_by_status(
        &self,
        org_id: Option<OrgId>,
        status: Option<JobStatus>,
    ) -> EngineResult<Vec<Job>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| org_id.map_or(true, |o| j.org_id == o))
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_sequence::{SequenceDefinition, StepDefinition};
    use serde_json::json;

    fn sample_job(org_id: OrgId) -> Job {
        let definition = SequenceDefinition::new(
            "debrief",
            1,
            vec![StepDefinition::new("only", "skill.only")],
        );
        Job::from_definition(org_id, None, &definition, json!({}))
    }

    #[test]
    fn insert_get_save_round_trip() {
        let store = InMemoryJobStore::new();
        let mut job = sample_job(OrgId::new());
        let id = job.id;
        store.insert(job.clone()).unwrap();

        job.mark_finished(JobStatus::Completed);
        store.save(&job).unwrap();

        let loaded = store.get(id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
    }

    #[test]
    fn duplicate_insert_is_a_conflict() {
        let store = InMemoryJobStore::new();
        let job = sample_job(OrgId::new());
        store.insert(job.clone()).unwrap();
        assert!(matches!(store.insert(job), Err(EngineError::Conflict(_))));
    }

    #[test]
    fn record_child_is_idempotent() {
        let store = InMemoryJobStore::new();
        let parent = sample_job(OrgId::new());
        let parent_id = parent.id;
        store.insert(parent).unwrap();

        let child_id = JobId::new();
        store.record_child(parent_id, child_id).unwrap();
        store.record_child(parent_id, child_id).unwrap();

        let loaded = store.get(parent_id).unwrap().unwrap();
        assert_eq!(loaded.chain.child_job_ids, vec![child_id]);
    }

    #[test]
    fn list_filters_by_org_and_status() {
        let store = InMemoryJobStore::new();
        let org_a = OrgId::new();
        let org_b = OrgId::new();
        store.insert(sample_job(org_a)).unwrap();
        store.insert(sample_job(org_b)).unwrap();

        assert_eq!(store.list_by_status(Some(org_a), None).unwrap().len(), 1);
        assert_eq!(
            store
                .list_by_status(None, Some(JobStatus::Running))
                .unwrap()
                .len(),
            2
        );
        assert!(
            store
                .list_by_status(None, Some(JobStatus::Failed))
                .unwrap()
                .is_empty()
        );
    }
}
