//! Mirrors local mutations to the remote document store.
//!
//! Local state is the source of truth. Every successful local mutation
//! enqueues one `RemoteWrite`; a single background task drains the queue in
//! order, so writes reach the remote store in the order they were issued.
//! Each write is tagged with the principal it was issued for, and its result
//! is dropped if that principal is no longer active when it completes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

use crate::errors::RemoteError;
use crate::identity::PrincipalObserver;
use crate::models::{Job, Principal};
use crate::remote::{RemoteConfig, RemoteGateway, RemoteSettings};

pub const JOBS_COLLECTION: &str = "jobs";
pub const STAGES_COLLECTION: &str = "stages";

/// What happened to the remote side of a local mutation. Never an error:
/// the local change has already been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAdvisory {
    /// Handed to the background worker; see `SyncStatus` for the result.
    Queued,
    NotConfigured,
    Failed(String),
}

impl SyncAdvisory {
    pub fn is_warning(&self) -> bool {
        matches!(self, SyncAdvisory::Failed(_))
    }

    /// Folds the advisories of a multi-write mutation; a failure wins.
    pub fn combine(advisories: impl IntoIterator<Item = SyncAdvisory>) -> SyncAdvisory {
        let mut combined = SyncAdvisory::NotConfigured;
        for advisory in advisories {
            match advisory {
                SyncAdvisory::Failed(_) => return advisory,
                SyncAdvisory::Queued => combined = SyncAdvisory::Queued,
                SyncAdvisory::NotConfigured => {}
            }
        }
        combined
    }
}

/// Result of a local mutation. Targeting a missing id is not an error, it
/// just leaves everything `Unchanged`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Applied(SyncAdvisory),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn advisory(&self) -> Option<&SyncAdvisory> {
        match self {
            Outcome::Applied(advisory) => Some(advisory),
            Outcome::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteWrite {
    InsertJob(Job),
    UpdateJob(Job),
    DeleteJob { id: String },
    PutStages(Vec<String>),
}

impl RemoteWrite {
    pub fn describe(&self) -> String {
        match self {
            RemoteWrite::InsertJob(job) => format!("insert job {}", job.id),
            RemoteWrite::UpdateJob(job) => format!("update job {}", job.id),
            RemoteWrite::DeleteJob { id } => format!("delete job {}", id),
            RemoteWrite::PutStages(stages) => format!("save {} stages", stages.len()),
        }
    }

    async fn apply(&self, gateway: &RemoteGateway, principal_id: &str) -> Result<(), RemoteError> {
        match self {
            RemoteWrite::InsertJob(job) => {
                let id = gateway.insert_one(JOBS_COLLECTION, &to_document(job)?).await?;
                tracing::debug!(job = %job.id, remote_id = %id, "job inserted remotely");
            }
            RemoteWrite::UpdateJob(job) => {
                // Upsert so jobs created before the remote was configured still land
                gateway
                    .update_one(
                        JOBS_COLLECTION,
                        &json!({ "id": job.id }),
                        &json!({ "$set": to_document(job)? }),
                        true,
                    )
                    .await?;
            }
            RemoteWrite::DeleteJob { id } => {
                gateway
                    .delete_one(JOBS_COLLECTION, &json!({ "id": id, "userId": principal_id }))
                    .await?;
            }
            RemoteWrite::PutStages(stages) => {
                gateway
                    .update_one(
                        STAGES_COLLECTION,
                        &json!({ "userId": principal_id }),
                        &json!({ "$set": { "userId": principal_id, "stages": stages } }),
                        true,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn to_document(job: &Job) -> Result<Value, RemoteError> {
    serde_json::to_value(job).map_err(|e| RemoteError::Decode(format!("encode job {}: {}", job.id, e)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub write: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Remote sync bookkeeping for the active principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub pending: usize,
    pub synced: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncStatus {
    pub fn is_clean(&self) -> bool {
        self.pending == 0 && self.failures.is_empty()
    }
}

/// The principal's data as the remote store holds it.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub principal_id: String,
    pub jobs: Vec<Job>,
    pub stages: Option<Vec<String>>,
    /// Documents that did not decode or belong to someone else.
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct Shared {
    active: Option<String>,
    status: SyncStatus,
}

enum Envelope {
    Write {
        principal_id: String,
        config: RemoteConfig,
        write: RemoteWrite,
    },
    Flush(oneshot::Sender<()>),
}

pub struct Reconciler {
    settings: Rc<RemoteSettings>,
    client: reqwest::Client,
    shared: Arc<Mutex<Shared>>,
    queue: RefCell<Option<mpsc::UnboundedSender<Envelope>>>,
}

impl Reconciler {
    pub fn new(settings: Rc<RemoteSettings>) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
            shared: Arc::new(Mutex::new(Shared::default())),
            queue: RefCell::new(None),
        }
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    pub fn status(&self) -> SyncStatus {
        lock(&self.shared).status.clone()
    }

    /// Hands a write to the background worker. Returns immediately.
    pub fn push(&self, principal_id: &str, write: RemoteWrite) -> SyncAdvisory {
        let Some(config) = self.settings.config() else {
            tracing::debug!(write = %write.describe(), "remote not configured, skipping");
            return SyncAdvisory::NotConfigured;
        };
        let queue = match self.sender() {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(error = %e, write = %write.describe(), "remote sync unavailable");
                return SyncAdvisory::Failed(e.to_string());
            }
        };

        let description = write.describe();
        lock(&self.shared).status.pending += 1;
        let envelope = Envelope::Write {
            principal_id: principal_id.to_string(),
            config,
            write,
        };
        if queue.send(envelope).is_err() {
            let mut shared = lock(&self.shared);
            shared.status.pending = shared.status.pending.saturating_sub(1);
            self.queue.borrow_mut().take();
            tracing::warn!(write = %description, "remote sync worker stopped");
            return SyncAdvisory::Failed("remote sync worker stopped".to_string());
        }
        SyncAdvisory::Queued
    }

    /// Waits until every write queued before this call has completed.
    pub async fn flush(&self) {
        let queue = self.queue.borrow().clone();
        let Some(queue) = queue else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if queue.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Reads the principal's jobs and stage list from the remote store,
    /// after letting queued writes land.
    pub async fn fetch(&self, principal_id: &str) -> Result<RemoteSnapshot, RemoteError> {
        let Some(config) = self.settings.config() else {
            return Err(RemoteError::NotConfigured);
        };
        self.flush().await;

        let gateway = RemoteGateway::new(self.client.clone(), Some(config));
        let filter = json!({ "userId": principal_id });
        let documents = gateway
            .find(JOBS_COLLECTION, &filter, &json!({ "dateAdded": -1 }))
            .await?;

        let mut snapshot = RemoteSnapshot {
            principal_id: principal_id.to_string(),
            ..Default::default()
        };
        for document in documents {
            match serde_json::from_value::<Job>(document) {
                Ok(job) if job.owner_id == principal_id => snapshot.jobs.push(job),
                Ok(job) => {
                    tracing::warn!(job = %job.id, owner = %job.owner_id, "skipping remote job owned by another user");
                    snapshot.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable remote job");
                    snapshot.skipped += 1;
                }
            }
        }

        if let Some(document) = gateway.find_one(STAGES_COLLECTION, &filter).await? {
            match document.get("stages").cloned().map(serde_json::from_value::<Vec<String>>) {
                Some(Ok(stages)) => snapshot.stages = Some(stages),
                _ => {
                    tracing::warn!("skipping undecodable remote stage list");
                    snapshot.skipped += 1;
                }
            }
        }

        tracing::info!(
            principal = %principal_id,
            jobs = snapshot.jobs.len(),
            skipped = snapshot.skipped,
            "fetched remote copy"
        );
        Ok(snapshot)
    }

    pub fn is_active(&self, principal_id: &str) -> bool {
        lock(&self.shared).active.as_deref() == Some(principal_id)
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Envelope>, RemoteError> {
        if let Some(queue) = self.queue.borrow().as_ref() {
            return Ok(queue.clone());
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| RemoteError::RuntimeUnavailable)?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run_worker(self.client.clone(), self.shared.clone(), rx));
        *self.queue.borrow_mut() = Some(tx.clone());
        Ok(tx)
    }
}

impl PrincipalObserver for Reconciler {
    fn principal_changed(&self, principal: Option<&Principal>) {
        let mut shared = lock(&self.shared);
        shared.active = principal.map(|p| p.id.clone());
        shared.status = SyncStatus::default();
    }
}

async fn run_worker(
    client: reqwest::Client,
    shared: Arc<Mutex<Shared>>,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = queue.recv().await {
        match envelope {
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
            Envelope::Write {
                principal_id,
                config,
                write,
            } => {
                let gateway = RemoteGateway::new(client.clone(), Some(config));
                let result = write.apply(&gateway, &principal_id).await;
                record(&shared, &principal_id, &write, result);
            }
        }
    }
}

fn record(shared: &Mutex<Shared>, principal_id: &str, write: &RemoteWrite, result: Result<(), RemoteError>) {
    let mut shared = lock(shared);
    if shared.active.as_deref() != Some(principal_id) {
        tracing::debug!(principal = %principal_id, write = %write.describe(), "discarding result for inactive user");
        return;
    }
    shared.status.pending = shared.status.pending.saturating_sub(1);
    match result {
        Ok(()) => {
            shared.status.synced += 1;
            tracing::debug!(write = %write.describe(), "synced");
        }
        Err(e) => {
            tracing::warn!(write = %write.describe(), error = %e, "remote sync failed");
            shared.status.failures.push(SyncFailure {
                write: write.describe(),
                error: e.to_string(),
                at: Utc::now(),
            });
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
