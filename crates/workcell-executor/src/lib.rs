//! `workcell-executor` — runs due jobs in isolated worker processes.
//!
//! # Overview
//!
//! The [`executor::Executor`] spawns one OS process per job run, tracks it in
//! the [`registry::ProcessRegistry`], and collects exactly one
//! [`event::ExecutionEvent`] per run over a loopback event channel. A single
//! listener task turns events into job callbacks, releases the process, and
//! forwards the event to the scheduler through [`dispatch::EventDispatcher`].
//!
//! | Piece              | Runs in        | Role                                       |
//! |--------------------|----------------|--------------------------------------------|
//! | `Executor`         | parent         | setup/teardown, submit, terminate, introspection |
//! | `ProcessRegistry`  | parent         | instance bookkeeping + per-job instance cap |
//! | listener loop      | parent (task)  | events → callbacks → cleanup → dispatch    |
//! | `worker::run_worker` | worker process | run one job function, report one event   |
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use workcell_core::config::WorkcellConfig;
//! use workcell_executor::{ChannelDispatcher, Executor, Job, SequentialInstanceIds};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//!     let executor = Executor::new(
//!         WorkcellConfig::default(),
//!         Arc::new(SequentialInstanceIds::new()),
//!         Arc::new(ChannelDispatcher::new(tx)),
//!     );
//!     executor.setup().await?;
//!
//!     let job = Job::new("nightly-answer", "answer").with_max_instances(1);
//!     executor.submit_job(&job, chrono::Utc::now()).await?;
//!     if let Some(event) = rx.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     executor.teardown(true).await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod executor;
pub mod instance;
pub mod job;
pub mod listener;
pub mod process;
pub mod registry;
pub mod types;
pub mod worker;

pub use dispatch::{ChannelDispatcher, EventDispatcher, InstanceIdAllocator, SequentialInstanceIds};
pub use error::{ExecutorError, Result, WorkerError};
pub use event::{ExecutionEvent, JobError, Outcome};
pub use executor::Executor;
pub use instance::JobInstance;
pub use job::Job;
pub use process::WorkerProcess;
pub use registry::ProcessRegistry;
pub use types::InstanceId;
pub use worker::{FunctionTable, JobCall, JobFailure, WorkerRequest};
