//! The record binding a job to one running worker process.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{job::Job, process::WorkerProcess, types::InstanceId};

/// One live run of a [`Job`]. Cheap to clone; snapshots handed out by the
/// executor share the underlying process handle.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub job: Job,
    pub id: InstanceId,
    /// Recorded at registration, before the process is spawned.
    pub start_time: DateTime<Utc>,
    pub process: Arc<WorkerProcess>,
}

impl JobInstance {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }
}
