//! Shared identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one concrete run of a job.
///
/// Allocated by the scheduler's [`crate::dispatch::InstanceIdAllocator`] at
/// submission time and never reused while an executor session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InstanceId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
