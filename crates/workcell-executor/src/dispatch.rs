//! Interfaces the executor consumes from its scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::{event::ExecutionEvent, types::InstanceId};

/// Hands out instance ids. Owned by the scheduler's job store.
pub trait InstanceIdAllocator: Send + Sync {
    fn allocate_instance_id(&self) -> InstanceId;
}

/// Receives every execution event after the job's own callbacks ran.
///
/// Called from the listener loop, so implementations must not block.
pub trait EventDispatcher: Send + Sync {
    fn dispatch_event(&self, event: ExecutionEvent);
}

/// Monotonic in-memory allocator starting at 1.
#[derive(Debug)]
pub struct SequentialInstanceIds {
    next: AtomicU64,
}

impl SequentialInstanceIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialInstanceIds {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceIdAllocator for SequentialInstanceIds {
    fn allocate_instance_id(&self) -> InstanceId {
        InstanceId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Forwards events into a bounded mpsc channel.
///
/// The sender is non-blocking (`try_send`) so the listener loop is never
/// stalled by a slow consumer; a full or closed channel drops the event
/// with a warning.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<ExecutionEvent>) -> Self {
        Self { tx }
    }
}

impl EventDispatcher for ChannelDispatcher {
    fn dispatch_event(&self, event: ExecutionEvent) {
        let job_id = event.job_id.clone();
        let instance_id = event.instance_id;
        if self.tx.try_send(event).is_err() {
            warn!(%job_id, %instance_id, "event channel full or closed, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Outcome;
    use chrono::Utc;

    fn event(instance_id: u64) -> ExecutionEvent {
        ExecutionEvent {
            session: "s".into(),
            job_id: "j".into(),
            instance_id: InstanceId(instance_id),
            run_time: Utc::now(),
            finished_at: Utc::now(),
            outcome: Outcome::Success {
                return_value: serde_json::Value::Null,
            },
        }
    }

    #[test]
    fn sequential_ids_advance() {
        let ids = SequentialInstanceIds::starting_at(10);
        assert_eq!(ids.allocate_instance_id(), InstanceId(10));
        assert_eq!(ids.allocate_instance_id(), InstanceId(11));
    }

    #[tokio::test]
    async fn channel_dispatcher_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let dispatcher = ChannelDispatcher::new(tx);

        dispatcher.dispatch_event(event(1));
        dispatcher.dispatch_event(event(2));

        assert_eq!(rx.recv().await.unwrap().instance_id, InstanceId(1));
        assert!(rx.try_recv().is_err());
    }
}
