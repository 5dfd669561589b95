//! Handle to one spawned worker process.
//!
//! The handle exists before the OS process does: the executor registers a
//! pending handle under the registry lock and attaches the child once the
//! spawn succeeds. All operations are safe to call in any state, which lets
//! the listener loop, `terminate_job`, and teardown race on the same handle.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, warn};

enum State {
    /// Registered, not yet spawned.
    Pending,
    Running(Child),
    /// OS resources released. Terminal.
    Closed,
}

pub struct WorkerProcess {
    name: String,
    /// 0 until a child is attached.
    pid: AtomicU32,
    state: Mutex<State>,
}

impl WorkerProcess {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: AtomicU32::new(0),
            state: Mutex::new(State::Pending),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Bind the spawned child to this handle.
    ///
    /// Returns `false` when the handle was already closed (the instance was
    /// cleaned up while spawning); the child is killed in that case.
    pub async fn attach(&self, mut child: Child) -> bool {
        let mut state = self.state.lock().await;
        if !matches!(*state, State::Pending) {
            warn!(process = %self.name, "attach on a handle that is no longer pending");
            let _ = child.start_kill();
            return false;
        }
        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::Release);
        }
        *state = State::Running(child);
        true
    }

    /// Whether the OS process is still running.
    pub async fn is_alive(&self) -> bool {
        let mut state = self.state.lock().await;
        match &mut *state {
            State::Running(child) => matches!(child.try_wait(), Ok(None)),
            State::Pending | State::Closed => false,
        }
    }

    /// Ask the process to stop (SIGTERM on Unix).
    pub async fn terminate(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let State::Running(child) = &mut *state else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Safety: pid is our direct child and has not been reaped yet
            // (try_wait above saw it running), so it cannot have been reused.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            debug!(process = %self.name, pid, "sent SIGTERM");
            return Ok(());
        }

        child.start_kill()
    }

    /// Force the process to stop (SIGKILL on Unix).
    pub async fn kill(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let State::Running(child) = &mut *state else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        debug!(process = %self.name, "killing");
        child.start_kill()
    }

    /// Wait up to `timeout` for the process to exit. Returns `true` once
    /// the process is known not to be running.
    pub async fn join(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().await;
        let State::Running(child) = &mut *state else {
            return true;
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(process = %self.name, %status, "process joined");
                true
            }
            Ok(Err(e)) => {
                warn!(process = %self.name, "wait failed: {e}");
                false
            }
            Err(_elapsed) => false,
        }
    }

    /// SIGKILL without awaiting, for contexts that cannot await (`Drop`).
    ///
    /// Returns `false` when the handle is busy in another task or holds no
    /// running child. The process is not reaped.
    pub fn kill_now(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        match &mut *state {
            State::Running(child) => child.start_kill().is_ok(),
            State::Pending | State::Closed => false,
        }
    }

    /// Release the child handle. Fails while the process is still running.
    pub async fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        if let State::Running(child) = &mut *state {
            if child.try_wait()?.is_none() {
                return Err(io::Error::other(format!(
                    "{} is still running",
                    self.name
                )));
            }
        }
        *state = State::Closed;
        Ok(())
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("name", &self.name)
            .field("pid", &self.pid())
            .finish()
    }
}
