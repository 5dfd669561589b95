//! Job definitions as seen by the executor.
//!
//! A [`Job`] is owned by the scheduler's job store; the executor only reads
//! it. The callable is referenced by name because it has to be resolved
//! inside a separate worker process, while callbacks and dynamic-argument
//! providers stay in the parent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{event::JobError, types::InstanceId};

/// Invoked by the listener loop after a successful run.
pub type SuccessCallback =
    Arc<dyn Fn(&str, InstanceId, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Invoked by the listener loop after a failed run.
pub type ErrorCallback =
    Arc<dyn Fn(&str, InstanceId, &JobError) -> anyhow::Result<()> + Send + Sync>;

/// Computes a fresh argument value every time the job is submitted.
pub type DynamicArg = Arc<dyn Fn() -> Value + Send + Sync>;

/// A named, reusable unit of work.
#[derive(Clone)]
pub struct Job {
    /// Stable identifier shared by every instance of this job.
    pub id: String,
    /// Name of the function in the worker's function table.
    pub func: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Evaluated at submission, not at definition or run time.
    pub dynamic_args: BTreeMap<String, DynamicArg>,
    /// Cap on concurrently live instances. `None` means unlimited.
    pub max_instances: Option<usize>,
    pub callback: Option<SuccessCallback>,
    pub error_callback: Option<ErrorCallback>,
}

impl Job {
    pub fn new(id: impl Into<String>, func: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            func: func.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            dynamic_args: BTreeMap::new(),
            max_instances: None,
            callback: None,
            error_callback: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    pub fn with_dynamic_arg<F>(mut self, name: impl Into<String>, provider: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.dynamic_args.insert(name.into(), Arc::new(provider));
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = Some(max);
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, InstanceId, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, InstanceId, &JobError) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    /// Static kwargs merged with freshly evaluated dynamic args.
    ///
    /// A dynamic arg replaces a static kwarg of the same name.
    pub fn resolve_kwargs(&self) -> Map<String, Value> {
        let mut merged = self.kwargs.clone();
        for (name, provider) in &self.dynamic_args {
            merged.insert(name.clone(), provider());
        }
        merged
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("func", &self.func)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("dynamic_args", &self.dynamic_args.keys().collect::<Vec<_>>())
            .field("max_instances", &self.max_instances)
            .field("callback", &self.callback.is_some())
            .field("error_callback", &self.error_callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn dynamic_args_are_evaluated_on_every_resolve() {
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let job = Job::new("sensor", "echo")
            .with_dynamic_arg("reading", move || json!(c.fetch_add(1, Ordering::SeqCst)));

        assert_eq!(job.resolve_kwargs()["reading"], json!(0));
        assert_eq!(job.resolve_kwargs()["reading"], json!(1));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dynamic_arg_overrides_static_kwarg() {
        let job = Job::new("sensor", "echo")
            .with_kwarg("unit", json!("C"))
            .with_kwarg("reading", json!("stale"))
            .with_dynamic_arg("reading", || json!(21.5));

        let kwargs = job.resolve_kwargs();
        assert_eq!(kwargs["unit"], json!("C"));
        assert_eq!(kwargs["reading"], json!(21.5));
    }

    #[test]
    fn debug_hides_closures() {
        let job = Job::new("j", "answer").on_success(|_, _, _| Ok(()));
        let rendered = format!("{job:?}");
        assert!(rendered.contains("callback: true"));
        assert!(rendered.contains("error_callback: false"));
    }
}
