use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::db::{jobs_key, stages_key, Database};
use crate::errors::{TrackerError, TrackerResult};
use crate::identity::PrincipalObserver;
use crate::jobs::JobStore;
use crate::models::{Principal, DEFAULT_STAGES};
use crate::sync::{Outcome, Reconciler, RemoteWrite, SyncAdvisory};

#[derive(Debug, Default)]
struct StageState {
    owner: Option<String>,
    stages: Vec<String>,
}

/// Ordered pipeline stages of the active principal. Names are unique and
/// a stage with jobs in it cannot be removed.
pub struct StageRegistry {
    db: Rc<Database>,
    reconciler: Rc<Reconciler>,
    jobs: Rc<JobStore>,
    state: RefCell<StageState>,
}

impl StageRegistry {
    pub fn new(db: Rc<Database>, reconciler: Rc<Reconciler>, jobs: Rc<JobStore>) -> Self {
        Self {
            db,
            reconciler,
            jobs,
            state: RefCell::new(StageState::default()),
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.state.borrow().stages.clone()
    }

    /// Stage new jobs land in when none is given.
    pub fn first(&self) -> Option<String> {
        self.state.borrow().stages.first().cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.borrow().stages.iter().any(|s| s == name)
    }

    pub fn add(&self, name: &str) -> TrackerResult<Outcome> {
        let owner = self.require_owner()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(TrackerError::Validation("Stage name is required.".to_string()));
        }
        if self.contains(name) {
            return Err(TrackerError::Validation(format!("Stage '{}' already exists.", name)));
        }

        let mut stages = self.list();
        stages.push(name.to_string());
        self.save(&owner, stages.clone())?;
        tracing::info!(stage = %name, "stage added");

        Ok(Outcome::Applied(self.reconciler.push(&owner, RemoteWrite::PutStages(stages))))
    }

    pub fn remove(&self, name: &str) -> TrackerResult<Outcome> {
        let owner = self.require_owner()?;
        let in_use = self.jobs.count_with_status(name);
        if in_use > 0 {
            return Err(TrackerError::StageInUse {
                stage: name.to_string(),
                jobs: in_use,
            });
        }
        if !self.contains(name) {
            return Ok(Outcome::Unchanged);
        }

        let mut stages = self.list();
        if stages.len() == 1 {
            return Err(TrackerError::Validation("At least one stage is required.".to_string()));
        }
        stages.retain(|s| s != name);
        self.save(&owner, stages.clone())?;
        tracing::info!(stage = %name, "stage removed");

        Ok(Outcome::Applied(self.reconciler.push(&owner, RemoteWrite::PutStages(stages))))
    }

    /// Renames in place and moves every job in `old` to `new`. Stages and
    /// jobs are written in one transaction; on error neither changes.
    pub fn rename(&self, old: &str, new: &str) -> TrackerResult<Outcome> {
        let owner = self.require_owner()?;
        let new = new.trim();
        if new.is_empty() || old == new || !self.contains(old) {
            return Ok(Outcome::Unchanged);
        }
        if self.contains(new) {
            return Err(TrackerError::Validation(format!("Stage '{}' already exists.", new)));
        }

        let stages: Vec<String> = self
            .list()
            .into_iter()
            .map(|s| if s == old { new.to_string() } else { s })
            .collect();
        let (jobs, moved) = self.jobs.with_status_renamed(old, new);

        self.db.set_many(&[
            (stages_key(&owner), serde_json::to_string(&stages)?),
            (jobs_key(&owner), JobStore::encode(&jobs)?),
        ])?;
        self.state.borrow_mut().stages = stages.clone();
        self.jobs.replace_persisted(jobs);
        tracing::info!(from = %old, to = %new, jobs = moved.len(), "stage renamed");

        let mut advisories = vec![self.reconciler.push(&owner, RemoteWrite::PutStages(stages))];
        for job in moved {
            advisories.push(self.reconciler.push(&owner, RemoteWrite::UpdateJob(job)));
        }
        Ok(Outcome::Applied(SyncAdvisory::combine(advisories)))
    }

    /// Appends remote stage names not present locally. Returns how many.
    pub fn merge_remote(&self, principal_id: &str, remote: &[String]) -> TrackerResult<usize> {
        let owner = self.require_owner()?;
        if owner != principal_id {
            tracing::warn!(snapshot = %principal_id, "discarding remote stages for inactive user");
            return Ok(0);
        }
        let mut stages = self.list();
        let before = stages.len();
        stages.extend(remote.iter().map(|name| name.trim().to_string()));
        let stages = dedupe(stages);
        let appended = stages.len().saturating_sub(before);
        if appended > 0 {
            self.save(&owner, stages)?;
            tracing::info!(appended, "imported remote stages");
        }
        Ok(appended)
    }

    fn save(&self, owner: &str, stages: Vec<String>) -> TrackerResult<()> {
        self.db.set(&stages_key(owner), &serde_json::to_string(&stages)?)?;
        self.state.borrow_mut().stages = stages;
        Ok(())
    }

    fn require_owner(&self) -> TrackerResult<String> {
        self.state
            .borrow()
            .owner
            .clone()
            .ok_or(TrackerError::NoActivePrincipal)
    }

    fn load(&self, owner: &str) -> TrackerResult<Vec<String>> {
        if let Some(raw) = self.db.get(&stages_key(owner))? {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(stored) => {
                    let stored_len = stored.len();
                    let stages = dedupe(stored);
                    if !stages.is_empty() {
                        if stages.len() != stored_len {
                            tracing::warn!(principal = %owner, dropped = stored_len - stages.len(), "stored stage list repeats names, keeping first occurrences");
                            self.db.set(&stages_key(owner), &serde_json::to_string(&stages)?)?;
                        }
                        return Ok(stages);
                    }
                    tracing::warn!(principal = %owner, "stored stage list is empty, using defaults");
                }
                Err(e) => tracing::warn!(error = %e, principal = %owner, "stored stages are unreadable, using defaults"),
            }
        }
        let defaults: Vec<String> = DEFAULT_STAGES.iter().map(|s| s.to_string()).collect();
        self.db.set(&stages_key(owner), &serde_json::to_string(&defaults)?)?;
        Ok(defaults)
    }
}

/// Drops blank and repeated names, keeping the first occurrence.
fn dedupe(stages: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    stages
        .into_iter()
        .filter(|s| !s.trim().is_empty() && seen.insert(s.clone()))
        .collect()
}

impl PrincipalObserver for StageRegistry {
    fn principal_changed(&self, principal: Option<&Principal>) {
        *self.state.borrow_mut() = StageState::default();
        let Some(principal) = principal else { return };

        let stages = self.load(&principal.id).unwrap_or_else(|e| {
            tracing::warn!(error = %e, principal = %principal.id, "failed to load stages, using defaults");
            DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()
        });
        let mut state = self.state.borrow_mut();
        state.owner = Some(principal.id.clone());
        state.stages = stages;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewJob;
    use crate::remote::RemoteSettings;

    fn principal(id: &str) -> Principal {
        Principal {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            name: id.to_string(),
        }
    }

    struct Fixture {
        db: Rc<Database>,
        jobs: Rc<JobStore>,
        stages: StageRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Rc::new(Database::open_in_memory().unwrap());
            let settings = Rc::new(RemoteSettings::load(db.clone()).unwrap());
            let reconciler = Rc::new(Reconciler::new(settings));
            let jobs = Rc::new(JobStore::new(db.clone(), reconciler.clone()));
            let stages = StageRegistry::new(db.clone(), reconciler, jobs.clone());
            Self { db, jobs, stages }
        }

        fn login(&self, id: &str) {
            let p = principal(id);
            self.jobs.principal_changed(Some(&p));
            self.stages.principal_changed(Some(&p));
        }

        fn add_job(&self, status: &str) -> String {
            let (job, _) = self
                .jobs
                .add(NewJob {
                    company: "Acme".to_string(),
                    title: "SWE".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                })
                .unwrap();
            job.id
        }
    }

    #[test]
    fn test_defaults_on_first_use_are_persisted() {
        let f = Fixture::new();
        f.login("u1");
        assert_eq!(f.stages.list(), DEFAULT_STAGES.to_vec());
        assert_eq!(f.stages.first().as_deref(), Some("Saved"));
        assert!(f.db.get(&stages_key("u1")).unwrap().is_some());
    }

    #[test]
    fn test_operations_require_principal() {
        let f = Fixture::new();
        assert!(matches!(f.stages.add("Screen"), Err(TrackerError::NoActivePrincipal)));
        assert!(matches!(f.stages.remove("Saved"), Err(TrackerError::NoActivePrincipal)));
        assert!(f.stages.list().is_empty());
    }

    #[test]
    fn test_add_appends_and_rejects_blank_or_duplicate() {
        let f = Fixture::new();
        f.login("u1");
        assert!(f.stages.add("  Phone Screen ").unwrap().is_applied());
        assert_eq!(f.stages.list().last().map(String::as_str), Some("Phone Screen"));

        let before = f.stages.list();
        assert!(matches!(f.stages.add("Applied"), Err(TrackerError::Validation(_))));
        assert!(matches!(f.stages.add("   "), Err(TrackerError::Validation(_))));
        assert_eq!(f.stages.list(), before);
        assert_eq!(f.stages.list().iter().filter(|s| *s == "Applied").count(), 1);
    }

    #[test]
    fn test_add_is_case_sensitive() {
        let f = Fixture::new();
        f.login("u1");
        assert!(f.stages.add("applied").unwrap().is_applied());
        assert_eq!(f.stages.list().len(), 6);
    }

    #[test]
    fn test_remove_in_use_stage_fails_and_leaves_registry() {
        let f = Fixture::new();
        f.login("u1");
        f.add_job("Applied");
        let before = f.stages.list();

        let err = f.stages.remove("Applied").unwrap_err();
        assert!(matches!(err, TrackerError::StageInUse { jobs: 1, .. }));
        assert_eq!(f.stages.list(), before);
    }

    #[test]
    fn test_remove_unused_stage() {
        let f = Fixture::new();
        f.login("u1");
        assert!(f.stages.remove("Offer").unwrap().is_applied());
        assert!(!f.stages.contains("Offer"));
        assert_eq!(f.stages.remove("Offer").unwrap(), Outcome::Unchanged);
    }

    #[test]
    fn test_last_stage_cannot_be_removed() {
        let f = Fixture::new();
        f.login("u1");
        for stage in ["Applied", "Interviewing", "Offer", "Rejected"] {
            f.stages.remove(stage).unwrap();
        }
        assert!(matches!(f.stages.remove("Saved"), Err(TrackerError::Validation(_))));
        assert_eq!(f.stages.list(), vec!["Saved".to_string()]);
    }

    #[test]
    fn test_rename_cascades_to_jobs_and_keeps_position() {
        let f = Fixture::new();
        f.login("u1");
        let a = f.add_job("Applied");
        let b = f.add_job("Applied");
        let c = f.add_job("Saved");

        assert!(f.stages.rename("Applied", "Submitted").unwrap().is_applied());
        assert_eq!(f.stages.list()[1], "Submitted");
        assert!(!f.stages.contains("Applied"));
        assert_eq!(f.jobs.count_with_status("Applied"), 0);
        assert_eq!(f.jobs.get(&a).unwrap().status, "Submitted");
        assert_eq!(f.jobs.get(&b).unwrap().status, "Submitted");
        assert_eq!(f.jobs.get(&c).unwrap().status, "Saved");

        // Both survive a reload
        f.login("u1");
        assert_eq!(f.stages.list()[1], "Submitted");
        assert_eq!(f.jobs.by_status("Submitted").len(), 2);
    }

    #[test]
    fn test_failed_rename_changes_nothing() {
        let f = Fixture::new();
        f.login("u1");
        let a = f.add_job("Applied");
        let before = f.stages.list();
        f.db.conn()
            .execute_batch(
                r#"
                CREATE TRIGGER reject_jobs_insert BEFORE INSERT ON kv
                WHEN NEW.key LIKE 'jobtrack_data_%'
                BEGIN SELECT RAISE(ABORT, 'disk full'); END;
                CREATE TRIGGER reject_jobs_update BEFORE UPDATE ON kv
                WHEN NEW.key LIKE 'jobtrack_data_%'
                BEGIN SELECT RAISE(ABORT, 'disk full'); END;
                "#,
            )
            .unwrap();

        assert!(matches!(
            f.stages.rename("Applied", "Submitted"),
            Err(TrackerError::Storage(_))
        ));
        assert_eq!(f.stages.list(), before);
        assert_eq!(f.jobs.get(&a).unwrap().status, "Applied");
        assert_eq!(f.jobs.by_status("Applied").len(), 1);

        f.db.conn()
            .execute_batch("DROP TRIGGER reject_jobs_insert; DROP TRIGGER reject_jobs_update;")
            .unwrap();
        f.login("u1");
        assert_eq!(f.stages.list(), before);
        assert_eq!(f.jobs.get(&a).unwrap().status, "Applied");
        let stored = f.db.get(&stages_key("u1")).unwrap().unwrap();
        assert!(stored.contains("\"Applied\""));
        assert!(!stored.contains("Submitted"));
    }

    #[test]
    fn test_repeated_stored_names_keep_first_occurrence() {
        let f = Fixture::new();
        f.db.set(
            &stages_key("u1"),
            r#"["Saved","Offer","Interviewing","Offer","Rejected"]"#,
        )
        .unwrap();
        f.login("u1");
        f.add_job("Offer");

        assert_eq!(f.stages.list(), vec!["Saved", "Offer", "Interviewing", "Rejected"]);
        let stored: Vec<String> =
            serde_json::from_str(&f.db.get(&stages_key("u1")).unwrap().unwrap()).unwrap();
        assert_eq!(stored, f.stages.list());

        let stats = f.jobs.stats(&f.stages.list());
        let staged: usize = stats.by_stage.iter().map(|s| s.count).sum();
        assert!(staged <= stats.total);
        assert_eq!(stats.count("Offer"), Some(1));
    }

    #[test]
    fn test_rename_noops() {
        let f = Fixture::new();
        f.login("u1");
        assert_eq!(f.stages.rename("Applied", "  ").unwrap(), Outcome::Unchanged);
        assert_eq!(f.stages.rename("Applied", "Applied").unwrap(), Outcome::Unchanged);
        assert_eq!(f.stages.rename("Nope", "Other").unwrap(), Outcome::Unchanged);
        assert_eq!(f.stages.list(), DEFAULT_STAGES.to_vec());
    }

    #[test]
    fn test_rename_onto_existing_name_is_rejected() {
        let f = Fixture::new();
        f.login("u1");
        f.add_job("Applied");
        assert!(matches!(
            f.stages.rename("Applied", "Offer"),
            Err(TrackerError::Validation(_))
        ));
        assert_eq!(f.jobs.count_with_status("Applied"), 1);
    }

    #[test]
    fn test_corrupt_or_empty_stages_fall_back_to_defaults() {
        let f = Fixture::new();
        f.db.set(&stages_key("u1"), "not json").unwrap();
        f.login("u1");
        assert_eq!(f.stages.list(), DEFAULT_STAGES.to_vec());

        f.db.set(&stages_key("u2"), "[]").unwrap();
        f.login("u2");
        assert_eq!(f.stages.list(), DEFAULT_STAGES.to_vec());
    }

    #[test]
    fn test_stages_are_per_principal() {
        let f = Fixture::new();
        f.login("u1");
        f.stages.add("Phone Screen").unwrap();
        f.login("u2");
        assert!(!f.stages.contains("Phone Screen"));
        f.login("u1");
        assert!(f.stages.contains("Phone Screen"));
    }

    #[test]
    fn test_merge_remote_appends_unknown_names() {
        let f = Fixture::new();
        f.login("u1");
        let remote = vec!["Saved".to_string(), "Phone Screen".to_string(), "".to_string()];
        assert_eq!(f.stages.merge_remote("u1", &remote).unwrap(), 1);
        assert_eq!(f.stages.list().last().map(String::as_str), Some("Phone Screen"));
        assert_eq!(f.stages.merge_remote("u2", &remote).unwrap(), 0);
    }

    #[test]
    fn test_merge_remote_ignores_repeated_names() {
        let f = Fixture::new();
        f.login("u1");
        let remote = vec!["Screen".to_string(), "Screen".to_string(), " Screen ".to_string()];
        assert_eq!(f.stages.merge_remote("u1", &remote).unwrap(), 1);
        assert_eq!(f.stages.list().iter().filter(|s| *s == "Screen").count(), 1);
    }
}
