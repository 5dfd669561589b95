//! Error types for the workcell-executor crate.

use thiserror::Error;

use crate::{job::Job, types::InstanceId};

/// Errors surfaced by [`crate::executor::Executor`] operations.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Operation attempted outside the setup/teardown window.
    #[error("Executor not set up")]
    NotRunning,

    /// The job already runs its maximum number of concurrent instances.
    /// Nothing was registered or spawned.
    #[error("Job \"{}\" has already reached its maximum number of instances ({max_instances})", .job.id)]
    MaxInstancesExceeded {
        job: Job,
        max_instances: usize,
        instance_ids: Vec<InstanceId>,
    },

    /// No live instance carries this id (finished, terminated, or never existed).
    #[error("Job instance {instance_id} not found")]
    InstanceNotFound { instance_id: InstanceId },

    /// The worker process could not be started. The instance has already
    /// been deregistered when this is returned.
    #[error("Failed to start worker for job \"{job_id}\" (instance {instance_id}): {source}")]
    Spawn {
        job_id: String,
        instance_id: InstanceId,
        #[source]
        source: std::io::Error,
    },

    /// The event channel could not be opened.
    #[error("Event channel error: {0}")]
    Channel(#[source] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Short error code string for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::NotRunning => "EXECUTOR_NOT_RUNNING",
            ExecutorError::MaxInstancesExceeded { .. } => "MAX_INSTANCES_EXCEEDED",
            ExecutorError::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            ExecutorError::Spawn { .. } => "SPAWN_FAILED",
            ExecutorError::Channel(_) => "CHANNEL_ERROR",
            ExecutorError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Errors raised inside a worker process while reading its request or
/// reporting its event. Job failures are not errors at this level; they
/// travel back to the parent as failure events.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed worker request: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not report event: {0}")]
    Channel(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecutorError>;
