pub mod db;
pub mod errors;
pub mod identity;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod remote;
pub mod stages;
pub mod sync;
pub mod tracker;

pub use errors::{RemoteError, TrackerError, TrackerResult};
pub use models::{DocumentKind, Job, JobDocument, NewJob, Principal, Stats};
pub use remote::RemoteConfig;
pub use sync::{Outcome, SyncAdvisory, SyncStatus};
pub use tracker::{PullReport, Tracker};
