//! The event listener loop: one background task per executor session.
//!
//! Drains the event queue, runs the job's success or error callback,
//! releases the instance, and forwards the event to the scheduler. A
//! failing or panicking callback is logged and never ends the loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    event::{ExecutionEvent, Outcome},
    executor::Shared,
    types::InstanceId,
};

/// Run until `shutdown` flips to `true` (or its sender is dropped).
pub(crate) async fn run(
    shared: Arc<Shared>,
    session: String,
    mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("waiting for event...");
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Some(event) => {
                    handle_event(&shared, &session, event).await;
                    debug!("waiting for event...");
                }
                None => {
                    debug!("event queue closed");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("event listener stopped");
}

async fn handle_event(shared: &Shared, session: &str, event: ExecutionEvent) {
    if event.session != session {
        warn!(
            job_id = %event.job_id,
            instance_id = %event.instance_id,
            "event from a foreign session, discarded"
        );
        return;
    }

    // Absent when terminate_job won the race against this completion.
    let instance = match shared.registry.lookup(event.instance_id) {
        Ok(instance) => instance,
        Err(_) => {
            warn!(
                job_id = %event.job_id,
                instance_id = %event.instance_id,
                "event for an instance that is no longer registered, discarded"
            );
            return;
        }
    };
    let job = &instance.job;

    debug!(job_id = %job.id, instance_id = %event.instance_id, "got event");

    match &event.outcome {
        Outcome::Success { return_value } => {
            info!(job_id = %job.id, instance_id = %event.instance_id, "job executed successfully");
            if let Some(callback) = &job.callback {
                guarded("callback", &job.id, event.instance_id, || {
                    callback(&job.id, event.instance_id, return_value)
                });
            }
        }
        Outcome::Failure { error } => {
            error!(
                job_id = %job.id,
                instance_id = %event.instance_id,
                kind = %error.kind,
                "job raised an error\n{}",
                error.trace
            );
            if let Some(callback) = &job.error_callback {
                guarded("error callback", &job.id, event.instance_id, || {
                    callback(&job.id, event.instance_id, error)
                });
            }
        }
    }

    shared.cleanup_instance(&job.id, event.instance_id, false).await;

    let dispatcher = Arc::clone(&shared.dispatcher);
    if catch_unwind(AssertUnwindSafe(move || dispatcher.dispatch_event(event))).is_err() {
        error!(job_id = %job.id, "event dispatcher panicked");
    }
}

/// Run a user callback, containing both returned errors and panics.
fn guarded<F>(what: &str, job_id: &str, instance_id: InstanceId, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(job_id, %instance_id, "{what} failed: {e:?}"),
        Err(_) => error!(job_id, %instance_id, "{what} panicked"),
    }
}
