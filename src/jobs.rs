use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::db::{jobs_key, Database};
use crate::errors::{TrackerError, TrackerResult};
use crate::identity::PrincipalObserver;
use crate::models::{Job, NewJob, Principal, StageCount, Stats};
use crate::sync::{Outcome, Reconciler, RemoteSnapshot, RemoteWrite, SyncAdvisory};

#[derive(Debug, Default)]
struct JobState {
    owner: Option<String>,
    // Most recent first
    jobs: Vec<Job>,
    last_added: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub imported: usize,
    pub kept_local: usize,
    /// Remote documents repeating an id already imported from the same snapshot.
    pub duplicates: usize,
    /// The snapshot was for a principal that is no longer active.
    pub discarded: bool,
}

/// The active principal's job applications.
pub struct JobStore {
    db: Rc<Database>,
    reconciler: Rc<Reconciler>,
    state: RefCell<JobState>,
}

impl JobStore {
    pub fn new(db: Rc<Database>, reconciler: Rc<Reconciler>) -> Self {
        Self {
            db,
            reconciler,
            state: RefCell::new(JobState::default()),
        }
    }

    pub fn owner(&self) -> Option<String> {
        self.state.borrow().owner.clone()
    }

    pub fn list(&self) -> Vec<Job> {
        self.state.borrow().jobs.clone()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.state.borrow().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn by_status(&self, stage: &str) -> Vec<Job> {
        self.state
            .borrow()
            .jobs
            .iter()
            .filter(|j| j.status == stage)
            .cloned()
            .collect()
    }

    pub fn count_with_status(&self, stage: &str) -> usize {
        self.state.borrow().jobs.iter().filter(|j| j.status == stage).count()
    }

    pub fn add(&self, new: NewJob) -> TrackerResult<(Job, SyncAdvisory)> {
        let owner = self.require_owner()?;
        for (field, value) in [("Company", &new.company), ("Title", &new.title), ("Status", &new.status)] {
            if value.trim().is_empty() {
                return Err(TrackerError::Validation(format!("{} is required.", field)));
            }
        }

        let date_added = self.next_timestamp();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner.clone(),
            company: new.company.trim().to_string(),
            title: new.title.trim().to_string(),
            status: new.status,
            date_added,
            description: new.description,
            link: new.link.filter(|l| !l.trim().is_empty()),
            notes: new.notes.filter(|n| !n.trim().is_empty()),
            documents: new.documents,
        };

        let mut jobs = self.list();
        jobs.insert(0, job.clone());
        self.save(&owner, jobs)?;
        self.state.borrow_mut().last_added = Some(date_added);
        tracing::info!(job = %job.id, company = %job.company, "job added");

        let advisory = self.reconciler.push(&owner, RemoteWrite::InsertJob(job.clone()));
        Ok((job, advisory))
    }

    /// Replaces the job with the same id, keeping its position and owner.
    pub fn update(&self, job: Job) -> TrackerResult<Outcome> {
        let owner = self.require_owner()?;
        let mut jobs = self.list();
        let Some(slot) = jobs.iter_mut().find(|j| j.id == job.id) else {
            return Ok(Outcome::Unchanged);
        };
        let updated = Job {
            owner_id: slot.owner_id.clone(),
            ..job
        };
        *slot = updated.clone();
        self.save(&owner, jobs)?;
        tracing::debug!(job = %updated.id, "job updated");

        Ok(Outcome::Applied(self.reconciler.push(&owner, RemoteWrite::UpdateJob(updated))))
    }

    pub fn delete(&self, id: &str) -> TrackerResult<Outcome> {
        let owner = self.require_owner()?;
        let mut jobs = self.list();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Ok(Outcome::Unchanged);
        }
        self.save(&owner, jobs)?;
        tracing::info!(job = %id, "job deleted");

        Ok(Outcome::Applied(
            self.reconciler.push(&owner, RemoteWrite::DeleteJob { id: id.to_string() }),
        ))
    }

    pub fn toggle_document(&self, job_id: &str, doc_id: &str) -> TrackerResult<Outcome> {
        let owner = self.require_owner()?;
        let mut jobs = self.list();
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(Outcome::Unchanged);
        };
        let Some(doc) = job.documents.iter_mut().find(|d| d.id == doc_id) else {
            return Ok(Outcome::Unchanged);
        };
        doc.completed = !doc.completed;
        let updated = job.clone();
        self.save(&owner, jobs)?;

        Ok(Outcome::Applied(self.reconciler.push(&owner, RemoteWrite::UpdateJob(updated))))
    }

    /// Counts per known stage, in stage order. Jobs whose status matches no
    /// stage only count toward the total. A repeated stage name counts once.
    pub fn stats(&self, stages: &[String]) -> Stats {
        let state = self.state.borrow();
        let mut seen = HashSet::new();
        Stats {
            total: state.jobs.len(),
            by_stage: stages
                .iter()
                .filter(|stage| seen.insert(stage.as_str()))
                .map(|stage| StageCount {
                    stage: stage.clone(),
                    count: state.jobs.iter().filter(|j| &j.status == stage).count(),
                })
                .collect(),
        }
    }

    /// The collection with `old` statuses rewritten to `new`, plus the jobs
    /// that changed. Nothing is persisted.
    pub(crate) fn with_status_renamed(&self, old: &str, new: &str) -> (Vec<Job>, Vec<Job>) {
        let mut jobs = self.list();
        let mut changed = Vec::new();
        for job in jobs.iter_mut().filter(|j| j.status == old) {
            job.status = new.to_string();
            changed.push(job.clone());
        }
        (jobs, changed)
    }

    /// Swaps in a collection the caller has already persisted.
    pub(crate) fn replace_persisted(&self, jobs: Vec<Job>) {
        self.state.borrow_mut().jobs = jobs;
    }

    /// Imports remote-only jobs. Anything already held locally wins.
    pub fn merge_remote(&self, snapshot: &RemoteSnapshot) -> TrackerResult<MergeReport> {
        let owner = self.require_owner()?;
        if owner != snapshot.principal_id {
            tracing::warn!(snapshot = %snapshot.principal_id, "discarding remote copy for inactive user");
            return Ok(MergeReport {
                discarded: true,
                ..Default::default()
            });
        }

        let mut jobs = self.list();
        let local: HashSet<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let mut imported = HashSet::new();
        let mut report = MergeReport::default();
        for remote in &snapshot.jobs {
            if local.contains(&remote.id) {
                report.kept_local += 1;
            } else if !imported.insert(remote.id.clone()) {
                report.duplicates += 1;
            } else {
                jobs.push(remote.clone());
                report.imported += 1;
            }
        }
        if report.duplicates > 0 {
            tracing::warn!(duplicates = report.duplicates, "remote copy repeats job ids, keeping first");
        }

        if report.imported > 0 {
            // Stable, so local order survives among equal timestamps
            jobs.sort_by(|a, b| b.date_added.cmp(&a.date_added));
            self.save(&owner, jobs)?;
            tracing::info!(imported = report.imported, "imported remote jobs");
        }
        Ok(report)
    }

    pub(crate) fn encode(jobs: &[Job]) -> TrackerResult<String> {
        Ok(serde_json::to_string(jobs)?)
    }

    fn save(&self, owner: &str, jobs: Vec<Job>) -> TrackerResult<()> {
        self.db.set(&jobs_key(owner), &Self::encode(&jobs)?)?;
        self.state.borrow_mut().jobs = jobs;
        Ok(())
    }

    fn require_owner(&self) -> TrackerResult<String> {
        self.owner().ok_or(TrackerError::NoActivePrincipal)
    }

    // Never earlier than anything already in the collection, even if the
    // clock stepped back.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let state = self.state.borrow();
        let newest = state.jobs.iter().map(|j| j.date_added).chain(state.last_added).max();
        let now = Utc::now();
        match newest {
            Some(newest) if newest > now => newest,
            _ => now,
        }
    }

    fn load(&self, owner: &str) -> Vec<Job> {
        let raw = match self.db.get(&jobs_key(owner)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, principal = %owner, "failed to read jobs");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<Job>>(&raw) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, principal = %owner, "stored jobs are unreadable, starting empty");
                Vec::new()
            }
        }
    }
}

impl PrincipalObserver for JobStore {
    fn principal_changed(&self, principal: Option<&Principal>) {
        // Clear before loading so nothing from the previous user is visible
        *self.state.borrow_mut() = JobState::default();
        let Some(principal) = principal else { return };

        let jobs = self.load(&principal.id);
        tracing::debug!(principal = %principal.id, jobs = jobs.len(), "jobs loaded");
        let mut state = self.state.borrow_mut();
        state.owner = Some(principal.id.clone());
        state.jobs = jobs;
    }
}
