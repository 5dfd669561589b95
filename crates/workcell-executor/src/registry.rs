//! Concurrency-safe bookkeeping of live job instances.
//!
//! Two maps are kept in lock-step under a single mutex:
//! `instance_id → JobInstance` and `job_id → [instance_id]`. An id is in the
//! first map if and only if it appears exactly once in its job's list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    error::{ExecutorError, Result},
    instance::JobInstance,
    job::Job,
    process::WorkerProcess,
    types::InstanceId,
};

#[derive(Default)]
struct RegistryState {
    instances: HashMap<InstanceId, JobInstance>,
    by_job: HashMap<String, Vec<InstanceId>>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

/// Proof that `job` is below its instance cap, holding the registry lock
/// until [`Reservation::register`] consumes it.
pub struct Reservation<'a> {
    guard: MutexGuard<'a, RegistryState>,
    job: &'a Job,
}

impl Reservation<'_> {
    /// Insert the instance record and append its id to the job's list.
    pub fn register(
        mut self,
        instance_id: InstanceId,
        start_time: DateTime<Utc>,
        process: Arc<WorkerProcess>,
    ) -> JobInstance {
        let instance = JobInstance {
            job: self.job.clone(),
            id: instance_id,
            start_time,
            process,
        };
        self.guard.instances.insert(instance_id, instance.clone());
        self.guard
            .by_job
            .entry(self.job.id.clone())
            .or_default()
            .push(instance_id);
        debug!(job_id = %self.job.id, %instance_id, "instance registered");
        instance
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("instance registry poisoned")
    }

    /// Check `job.max_instances` and, on success, keep the lock so the
    /// caller registers within the same critical section.
    pub fn check_and_reserve<'a>(&'a self, job: &'a Job) -> Result<Reservation<'a>> {
        let guard = self.lock();
        if let Some(max) = job.max_instances {
            let current = guard.by_job.get(&job.id).map(Vec::as_slice).unwrap_or(&[]);
            if current.len() >= max {
                return Err(ExecutorError::MaxInstancesExceeded {
                    job: job.clone(),
                    max_instances: max,
                    instance_ids: current.to_vec(),
                });
            }
        }
        Ok(Reservation { guard, job })
    }

    pub fn lookup(&self, instance_id: InstanceId) -> Result<JobInstance> {
        self.lock()
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(ExecutorError::InstanceNotFound { instance_id })
    }

    /// Live instance ids of `job_id`, in registration order.
    pub fn instances_for(&self, job_id: &str) -> Vec<InstanceId> {
        self.lock().by_job.get(job_id).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<JobInstance> {
        let mut instances: Vec<JobInstance> = self.lock().instances.values().cloned().collect();
        instances.sort_by_key(|i| i.id);
        instances
    }

    /// Remove an instance from both maps. Returns `None` when it was already
    /// gone, so completion and forced termination may both call this.
    pub fn remove(&self, job_id: &str, instance_id: InstanceId) -> Option<JobInstance> {
        let mut state = self.lock();
        let removed = state.instances.remove(&instance_id)?;
        if let Some(ids) = state.by_job.get_mut(job_id) {
            ids.retain(|id| *id != instance_id);
            if ids.is_empty() {
                state.by_job.remove(job_id);
            }
        }
        debug!(job_id, %instance_id, "instance removed");
        Some(removed)
    }

    /// Drop every record, returning what was held.
    pub fn clear(&self) -> Vec<JobInstance> {
        let mut state = self.lock();
        state.by_job.clear();
        state.instances.drain().map(|(_, instance)| instance).collect()
    }

    /// `job_id:[ids]` summary for logging.
    pub fn running_summary(&self) -> String {
        let state = self.lock();
        let mut parts: Vec<String> = state
            .by_job
            .iter()
            .map(|(job_id, ids)| {
                let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                format!("{job_id}:[{}]", ids.join(","))
            })
            .collect();
        parts.sort();
        parts.join(", ")
    }

    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn register(registry: &ProcessRegistry, job: &Job, id: u64) -> Result<JobInstance> {
        let reservation = registry.check_and_reserve(job)?;
        Ok(reservation.register(
            InstanceId(id),
            Utc::now(),
            Arc::new(WorkerProcess::pending(format!("Process-{id}"))),
        ))
    }

    #[test]
    fn register_populates_both_maps() {
        let registry = ProcessRegistry::new();
        let job = Job::new("backup", "answer");

        register(&registry, &job, 1).unwrap();
        register(&registry, &job, 2).unwrap();

        assert_eq!(registry.instances_for("backup"), vec![InstanceId(1), InstanceId(2)]);
        assert_eq!(registry.lookup(InstanceId(2)).unwrap().job_id(), "backup");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_job_has_no_instances() {
        let registry = ProcessRegistry::new();
        assert!(registry.instances_for("nobody").is_empty());
    }

    #[test]
    fn lookup_missing_instance_fails() {
        let registry = ProcessRegistry::new();
        let err = registry.lookup(InstanceId(99)).unwrap_err();
        assert!(matches!(err, ExecutorError::InstanceNotFound { instance_id } if instance_id == InstanceId(99)));
    }

    #[test]
    fn cap_rejects_with_current_ids_and_registers_nothing() {
        let registry = ProcessRegistry::new();
        let job = Job::new("report", "answer").with_max_instances(1);

        register(&registry, &job, 1).unwrap();
        let err = register(&registry, &job, 2).unwrap_err();

        match err {
            ExecutorError::MaxInstancesExceeded {
                job,
                max_instances,
                instance_ids,
            } => {
                assert_eq!(job.id, "report");
                assert_eq!(max_instances, 1);
                assert_eq!(instance_ids, vec![InstanceId(1)]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(InstanceId(2)).is_err());
    }

    #[test]
    fn zero_cap_rejects_everything() {
        let registry = ProcessRegistry::new();
        let job = Job::new("paused", "answer").with_max_instances(0);
        assert!(register(&registry, &job, 1).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ProcessRegistry::new();
        let job = Job::new("sync", "answer");
        register(&registry, &job, 1).unwrap();
        register(&registry, &job, 2).unwrap();

        assert!(registry.remove("sync", InstanceId(1)).is_some());
        assert!(registry.remove("sync", InstanceId(1)).is_none());

        assert_eq!(registry.instances_for("sync"), vec![InstanceId(2)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.running_summary(), "sync:[2]");
    }

    #[test]
    fn removing_last_instance_frees_a_slot() {
        let registry = ProcessRegistry::new();
        let job = Job::new("single", "answer").with_max_instances(1);

        register(&registry, &job, 1).unwrap();
        registry.remove("single", InstanceId(1));
        register(&registry, &job, 2).unwrap();

        assert_eq!(registry.instances_for("single"), vec![InstanceId(2)]);
    }

    #[test]
    fn clear_empties_both_maps() {
        let registry = ProcessRegistry::new();
        let a = Job::new("a", "answer");
        let b = Job::new("b", "answer");
        register(&registry, &a, 1).unwrap();
        register(&registry, &b, 2).unwrap();

        let drained = registry.clear();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.instances_for("a").is_empty());
        assert_eq!(registry.running_summary(), "");
    }

    #[test]
    fn concurrent_reservations_never_exceed_the_cap() {
        const CAP: usize = 3;
        let registry = Arc::new(ProcessRegistry::new());
        let job = Job::new("capped", "answer").with_max_instances(CAP);

        let handles: Vec<_> = (0..16u64)
            .map(|id| {
                let registry = Arc::clone(&registry);
                let job = job.clone();
                thread::spawn(move || register(&registry, &job, id).is_ok())
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, CAP);
        assert_eq!(registry.instances_for("capped").len(), CAP);
    }
}
