use std::rc::Rc;

use crate::db::Database;
use crate::errors::{TrackerError, TrackerResult};
use crate::identity::IdentityContext;
use crate::jobs::{JobStore, MergeReport};
use crate::models::{Job, NewJob, Principal, Stats};
use crate::remote::{RemoteConfig, RemoteSettings};
use crate::stages::StageRegistry;
use crate::sync::{Outcome, Reconciler, SyncAdvisory, SyncStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub jobs: MergeReport,
    pub stages_added: usize,
    pub skipped: usize,
}

/// One tracker session over a local database: identity, the active
/// principal's jobs and stages, and remote mirroring. Everything a front
/// end needs goes through here.
pub struct Tracker {
    identity: IdentityContext,
    settings: Rc<RemoteSettings>,
    reconciler: Rc<Reconciler>,
    jobs: Rc<JobStore>,
    stages: Rc<StageRegistry>,
}

impl Tracker {
    /// Wires the components together and restores any saved session.
    pub fn open(db: Database) -> TrackerResult<Self> {
        let db = Rc::new(db);
        let settings = Rc::new(RemoteSettings::load(db.clone())?);
        let reconciler = Rc::new(Reconciler::new(settings.clone()));
        let jobs = Rc::new(JobStore::new(db.clone(), reconciler.clone()));
        let stages = Rc::new(StageRegistry::new(db.clone(), reconciler.clone(), jobs.clone()));

        let mut identity = IdentityContext::new(db);
        identity.subscribe(reconciler.clone());
        identity.subscribe(jobs.clone());
        identity.subscribe(stages.clone());
        identity.restore_session()?;

        Ok(Self {
            identity,
            settings,
            reconciler,
            jobs,
            stages,
        })
    }

    // --- Identity ---

    pub fn principal(&self) -> Option<&Principal> {
        self.identity.current()
    }

    pub fn signup(&mut self, name: &str, email: &str, password: &str) -> TrackerResult<Principal> {
        self.identity.signup(name, email, password)
    }

    pub fn login(&mut self, email: &str, password: &str) -> TrackerResult<Principal> {
        self.identity.login(email, password)
    }

    pub fn logout(&mut self) -> TrackerResult<()> {
        self.identity.logout()
    }

    // --- Jobs ---

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.list()
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs.get(id)
    }

    pub fn jobs_by_status(&self, stage: &str) -> Vec<Job> {
        self.jobs.by_status(stage)
    }

    /// A blank status puts the job in the first stage.
    pub fn add_job(&self, mut new: NewJob) -> TrackerResult<(Job, SyncAdvisory)> {
        if new.status.trim().is_empty() {
            new.status = self.stages.first().ok_or(TrackerError::NoActivePrincipal)?;
        }
        self.jobs.add(new)
    }

    pub fn update_job(&self, job: Job) -> TrackerResult<Outcome> {
        self.jobs.update(job)
    }

    pub fn delete_job(&self, id: &str) -> TrackerResult<Outcome> {
        self.jobs.delete(id)
    }

    pub fn toggle_document(&self, job_id: &str, doc_id: &str) -> TrackerResult<Outcome> {
        self.jobs.toggle_document(job_id, doc_id)
    }

    pub fn stats(&self) -> Stats {
        self.jobs.stats(&self.stages.list())
    }

    // --- Stages ---

    pub fn stages(&self) -> Vec<String> {
        self.stages.list()
    }

    pub fn add_stage(&self, name: &str) -> TrackerResult<Outcome> {
        self.stages.add(name)
    }

    pub fn remove_stage(&self, name: &str) -> TrackerResult<Outcome> {
        self.stages.remove(name)
    }

    pub fn rename_stage(&self, old: &str, new: &str) -> TrackerResult<Outcome> {
        self.stages.rename(old, new)
    }

    // --- Remote ---

    pub fn is_remote_configured(&self) -> bool {
        self.settings.is_configured()
    }

    pub fn remote_config(&self) -> Option<RemoteConfig> {
        self.settings.config()
    }

    pub fn configure_remote(&self, config: RemoteConfig) -> TrackerResult<RemoteConfig> {
        self.settings.save(config)
    }

    pub fn reset_remote(&self) -> TrackerResult<()> {
        self.settings.reset()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.reconciler.status()
    }

    /// Waits for queued remote writes to finish.
    pub async fn flush(&self) {
        self.reconciler.flush().await;
    }

    /// Pulls the remote copy and imports what only exists there. Local
    /// records always win.
    pub async fn pull(&self) -> TrackerResult<PullReport> {
        let principal_id = self
            .principal()
            .map(|p| p.id.clone())
            .ok_or(TrackerError::NoActivePrincipal)?;
        let snapshot = self.reconciler.fetch(&principal_id).await?;

        let jobs = self.jobs.merge_remote(&snapshot)?;
        let stages_added = match &snapshot.stages {
            Some(remote) if !jobs.discarded => self.stages.merge_remote(&principal_id, remote)?,
            _ => 0,
        };
        Ok(PullReport {
            jobs,
            stages_added,
            skipped: snapshot.skipped,
        })
    }
}
