//! Worker entry point: the code that runs inside a spawned worker process.
//!
//! A worker binary builds a [`FunctionTable`] and hands it to
//! [`run_worker`]. The worker reads one [`WorkerRequest`] from stdin, runs
//! the named function, and reports exactly one [`ExecutionEvent`] back to
//! the executor, whether the function returned, failed, or panicked.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::{
    channel,
    error::WorkerError,
    event::{ExecutionEvent, JobError, Outcome},
    types::InstanceId,
};

/// Everything a worker needs to run one instance. Written by the executor
/// to the worker's stdin as a single JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub session: String,
    pub event_addr: SocketAddr,
    pub job_id: String,
    pub func: String,
    pub instance_id: InstanceId,
    pub run_time: DateTime<Utc>,
    pub args: Vec<Value>,
    /// Static kwargs already merged with the dynamic args evaluated at
    /// submission.
    pub kwargs: Map<String, Value>,
}

/// The arguments a job function is called with.
#[derive(Debug, Clone)]
pub struct JobCall {
    pub job_id: String,
    pub instance_id: InstanceId,
    pub run_time: DateTime<Utc>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl JobCall {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// Error a job function can return to choose the reported error kind.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    pub kind: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

pub type JobFn = Arc<dyn Fn(&JobCall) -> anyhow::Result<Value> + Send + Sync>;

/// Job functions known to a worker binary, keyed by the name a
/// [`crate::job::Job`] refers to them by.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, JobFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&JobCall) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
        self
    }

    pub fn get(&self, name: &str) -> Option<JobFn> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("functions", &self.names())
            .finish()
    }
}

/// Run the requested function and build its event. Never fails: every
/// outcome, including a panic, becomes either a success or a failure.
pub async fn execute(request: &WorkerRequest, functions: &FunctionTable) -> ExecutionEvent {
    let outcome = match functions.get(&request.func) {
        None => Outcome::Failure {
            error: JobError {
                kind: "UnknownFunction".into(),
                message: format!("no job function named \"{}\"", request.func),
                trace: format!(
                    "UnknownFunction: \"{}\" is not one of [{}]",
                    request.func,
                    functions.names().join(", ")
                ),
            },
        },
        Some(func) => {
            let call = JobCall {
                job_id: request.job_id.clone(),
                instance_id: request.instance_id,
                run_time: request.run_time,
                args: request.args.clone(),
                kwargs: request.kwargs.clone(),
            };
            // Blocking pool: job functions are synchronous, and a panic
            // surfaces as a JoinError instead of unwinding through us.
            match tokio::task::spawn_blocking(move || func(&call)).await {
                Ok(Ok(return_value)) => Outcome::Success { return_value },
                Ok(Err(err)) => Outcome::Failure {
                    error: describe_error(&err),
                },
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    Outcome::Failure {
                        error: JobError {
                            kind: "Panic".into(),
                            trace: format!("Panic: {message}"),
                            message,
                        },
                    }
                }
                Err(join_err) => Outcome::Failure {
                    error: JobError {
                        kind: "Cancelled".into(),
                        message: join_err.to_string(),
                        trace: format!("{join_err:?}"),
                    },
                },
            }
        }
    };

    match &outcome {
        Outcome::Success { .. } => {
            debug!(job_id = %request.job_id, instance_id = %request.instance_id, "job executed successfully")
        }
        Outcome::Failure { error } => {
            debug!(job_id = %request.job_id, instance_id = %request.instance_id, kind = %error.kind, "job raised an error")
        }
    }

    ExecutionEvent {
        session: request.session.clone(),
        job_id: request.job_id.clone(),
        instance_id: request.instance_id,
        run_time: request.run_time,
        finished_at: Utc::now(),
        outcome,
    }
}

/// Worker process main: read the request from stdin, execute it, and
/// report the event. Sending is the last thing the worker does.
pub async fn run_worker(functions: &FunctionTable) -> Result<(), WorkerError> {
    let mut raw = String::new();
    tokio::io::stdin().read_to_string(&mut raw).await?;
    let request: WorkerRequest = serde_json::from_str(&raw)?;

    let event = execute(&request, functions).await;

    debug!(job_id = %request.job_id, instance_id = %request.instance_id, "sending event");
    channel::send_event(request.event_addr, &event).await
}

fn describe_error(err: &anyhow::Error) -> JobError {
    let kind = err
        .downcast_ref::<JobFailure>()
        .map(|failure| failure.kind.clone())
        .unwrap_or_else(|| "Error".to_string());
    JobError {
        kind,
        message: err.to_string(),
        trace: format!("{err:?}"),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use serde_json::json;

    fn request(func: &str) -> WorkerRequest {
        WorkerRequest {
            session: "session-x".into(),
            event_addr: "127.0.0.1:9".parse().unwrap(),
            job_id: "job-1".into(),
            func: func.into(),
            instance_id: InstanceId(3),
            run_time: Utc::now(),
            args: vec![json!(2), json!(5)],
            kwargs: Map::from_iter([("scale".to_string(), json!(10))]),
        }
    }

    fn table() -> FunctionTable {
        FunctionTable::new()
            .register("mul", |call| {
                let a = call.arg(0).and_then(Value::as_i64).unwrap_or(0);
                let b = call.arg(1).and_then(Value::as_i64).unwrap_or(0);
                let scale = call.kwarg("scale").and_then(Value::as_i64).unwrap_or(1);
                Ok(json!(a * b * scale))
            })
            .register("fail", |_| Err(JobFailure::new("ValueError", "boom").into()))
            .register("chain", |_| {
                Err(anyhow::anyhow!("disk full")).context("writing report")
            })
            .register("panic", |_| panic!("worker exploded"))
    }

    #[tokio::test]
    async fn success_carries_return_value_and_identity() {
        let req = request("mul");
        let ev = execute(&req, &table()).await;

        assert!(ev.success());
        assert_eq!(ev.return_value(), Some(&json!(100)));
        assert_eq!(ev.session, "session-x");
        assert_eq!(ev.job_id, "job-1");
        assert_eq!(ev.instance_id, InstanceId(3));
        assert_eq!(ev.run_time, req.run_time);
    }

    #[tokio::test]
    async fn job_failure_keeps_its_kind() {
        let ev = execute(&request("fail"), &table()).await;
        let err = ev.error().unwrap();

        assert!(!ev.success());
        assert_eq!(err.kind, "ValueError");
        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn plain_errors_report_their_chain() {
        let ev = execute(&request("chain"), &table()).await;
        let err = ev.error().unwrap();

        assert_eq!(err.kind, "Error");
        assert_eq!(err.message, "writing report");
        assert!(err.trace.contains("disk full"));
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let ev = execute(&request("panic"), &table()).await;
        let err = ev.error().unwrap();

        assert_eq!(err.kind, "Panic");
        assert_eq!(err.message, "worker exploded");
    }

    #[tokio::test]
    async fn unknown_function_is_a_failure() {
        let ev = execute(&request("nope"), &table()).await;
        let err = ev.error().unwrap();

        assert_eq!(err.kind, "UnknownFunction");
        assert!(err.trace.contains("mul"));
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = request("mul");
        let decoded: WorkerRequest =
            serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(decoded.event_addr, req.event_addr);
        assert_eq!(decoded.kwargs["scale"], json!(10));
    }
}
