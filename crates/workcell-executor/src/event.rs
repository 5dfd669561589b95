//! Execution events: the one outcome record each job run produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::InstanceId;

/// Structured description of a failed job run.
///
/// Errors cannot be moved across a process boundary, so the worker flattens
/// them into strings before reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Error category, e.g. `ValueError`, `Panic`, `UnknownFunction`.
    pub kind: String,
    /// Top-level error message.
    pub message: String,
    /// Formatted error chain, including a backtrace when one was captured.
    pub trace: String,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Success XOR failure of one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { return_value: serde_json::Value },
    Failure { error: JobError },
}

/// Outcome of one job instance, produced exactly once by the worker and
/// consumed exactly once by the executor's listener loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Token of the executor session that spawned the worker.
    pub session: String,
    pub job_id: String,
    pub instance_id: InstanceId,
    /// When the run was scheduled (not when it actually started).
    pub run_time: DateTime<Utc>,
    /// When the worker finished the job function.
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ExecutionEvent {
    pub fn success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn return_value(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            Outcome::Success { return_value } => Some(return_value),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&JobError> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { error } => Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(outcome: Outcome) -> ExecutionEvent {
        ExecutionEvent {
            session: "s-1".into(),
            job_id: "report".into(),
            instance_id: InstanceId(7),
            run_time: Utc::now(),
            finished_at: Utc::now(),
            outcome,
        }
    }

    #[test]
    fn success_exposes_only_return_value() {
        let ev = event(Outcome::Success {
            return_value: json!(42),
        });
        assert!(ev.success());
        assert_eq!(ev.return_value(), Some(&json!(42)));
        assert!(ev.error().is_none());
    }

    #[test]
    fn failure_exposes_only_error() {
        let ev = event(Outcome::Failure {
            error: JobError {
                kind: "ValueError".into(),
                message: "boom".into(),
                trace: "ValueError: boom".into(),
            },
        });
        assert!(!ev.success());
        assert!(ev.return_value().is_none());
        assert_eq!(ev.error().unwrap().to_string(), "ValueError: boom");
    }

    #[test]
    fn wire_shape_is_flat_with_status_tag() {
        let ev = event(Outcome::Success {
            return_value: json!({"rows": 3}),
        });
        let value = serde_json::to_value(&ev).unwrap();

        assert_eq!(value["status"], "success");
        assert_eq!(value["instance_id"], 7);
        assert_eq!(value["return_value"]["rows"], 3);
        // failure payload must be absent on success
        assert!(value.get("error").is_none());
    }
}
