//! `workcell-core` — configuration and shared error types for the workcell
//! job-execution workspace.

pub mod config;
pub mod error;

pub use config::{ExecutorConfig, WorkcellConfig, WorkerConfig};
pub use error::{Result, WorkcellError};
