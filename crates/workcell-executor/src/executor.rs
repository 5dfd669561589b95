//! `Executor` — owns the process registry, the event channel, and the
//! listener loop, and exposes the submit/terminate/introspection surface the
//! scheduler drives.
//!
//! The executor is an explicit value: construct it with its collaborators
//! and share it behind an `Arc` when several tasks need it.

use std::io;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use workcell_core::config::WorkcellConfig;

use crate::{
    channel::EventChannel,
    dispatch::{EventDispatcher, InstanceIdAllocator},
    error::{ExecutorError, Result},
    instance::JobInstance,
    job::Job,
    listener,
    process::WorkerProcess,
    registry::ProcessRegistry,
    types::InstanceId,
    worker::WorkerRequest,
};

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

/// State shared between the executor façade and its listener task.
pub(crate) struct Shared {
    pub(crate) config: WorkcellConfig,
    pub(crate) registry: ProcessRegistry,
    pub(crate) dispatcher: Arc<dyn EventDispatcher>,
    /// Processes that outlived their forced cleanup; teardown finishes them.
    stragglers: Mutex<Vec<Arc<WorkerProcess>>>,
}

impl Shared {
    /// Deregister an instance and release its process.
    ///
    /// With `terminate`, a live process is signalled first. Returns `None`
    /// when another path already cleaned the instance up.
    pub(crate) async fn cleanup_instance(
        &self,
        job_id: &str,
        instance_id: InstanceId,
        terminate: bool,
    ) -> Option<JobInstance> {
        let instance = self.registry.remove(job_id, instance_id)?;
        let process = &instance.process;

        debug!(job_id, %instance_id, pid = ?process.pid(), terminate, "cleaning up instance");

        if process.is_alive().await {
            if terminate {
                debug!(job_id, %instance_id, "terminating process");
                if let Err(e) = process.terminate().await {
                    error!(job_id, %instance_id, "terminate failed: {e}");
                }
            }
            process
                .join(self.config.executor.terminate_join_timeout())
                .await;
        }

        if process.is_alive().await {
            error!(job_id, %instance_id, pid = ?process.pid(), "could not terminate process");
            self.stragglers
                .lock()
                .expect("straggler list poisoned")
                .push(Arc::clone(process));
        } else if let Err(e) = process.close().await {
            debug!(job_id, %instance_id, "close failed: {e}");
        } else {
            debug!(job_id, %instance_id, "process closed");
        }

        info!(running = %self.registry.running_summary(), "currently running");
        Some(instance)
    }

    fn take_stragglers(&self) -> Vec<Arc<WorkerProcess>> {
        std::mem::take(&mut *self.stragglers.lock().expect("straggler list poisoned"))
    }
}

/// One setup/teardown window.
struct Session {
    token: String,
    channel: EventChannel,
    shutdown_tx: watch::Sender<bool>,
    listener: JoinHandle<()>,
}

/// Runs jobs as isolated worker processes.
///
/// Call [`Executor::teardown`] before dropping. Dropping a running executor
/// kills its workers but cannot wait for them.
pub struct Executor {
    shared: Arc<Shared>,
    ids: Arc<dyn InstanceIdAllocator>,
    state: AtomicU8,
    session: Mutex<Option<Session>>,
    /// Serializes setup and teardown.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Executor {
    pub fn new(
        config: WorkcellConfig,
        ids: Arc<dyn InstanceIdAllocator>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry: ProcessRegistry::new(),
                dispatcher,
                stragglers: Mutex::new(Vec::new()),
            }),
            ids,
            state: AtomicU8::new(STOPPED),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ExecutorError::NotRunning)
        }
    }

    fn session_endpoint(&self) -> Result<(String, SocketAddr)> {
        self.ensure_running()?;
        self.session
            .lock()
            .expect("executor session poisoned")
            .as_ref()
            .map(|s| (s.token.clone(), s.channel.local_addr()))
            .ok_or(ExecutorError::NotRunning)
    }

    /// Open the event channel and start the listener loop. A no-op when
    /// already running; may be called again after `teardown`.
    pub async fn setup(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = EventChannel::bind(&self.shared.config.executor.bind, tx)
            .await
            .map_err(ExecutorError::Channel)?;
        let token = Uuid::new_v4().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(listener::run(
            Arc::clone(&self.shared),
            token.clone(),
            rx,
            shutdown_rx,
        ));

        info!(event_addr = %channel.local_addr(), "executor started");
        *self.session.lock().expect("executor session poisoned") = Some(Session {
            token,
            channel,
            shutdown_tx,
            listener,
        });
        self.state.store(RUNNING, Ordering::SeqCst);
        Ok(())
    }

    /// Stop accepting work, shut every worker down, and stop the listener.
    ///
    /// With `wait`, workers are allowed to finish on their own (until
    /// `teardown_force_after` rounds, if configured); otherwise they are
    /// terminated straight away. Either way this returns only once every
    /// worker process has been joined.
    pub async fn teardown(&self, wait: bool) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExecutorError::NotRunning);
        }
        info!(wait, "tearing down executor");

        // Stragglers already ignored a terminate, so they never get to wait.
        let stragglers = self.shared.take_stragglers();
        if !stragglers.is_empty() {
            self.shutdown_processes(&stragglers, false).await;
        }

        let processes: Vec<Arc<WorkerProcess>> = self
            .shared
            .registry
            .snapshot()
            .into_iter()
            .map(|instance| instance.process)
            .collect();
        self.shutdown_processes(&processes, wait).await;

        // Submissions that slipped in while we were waiting are forced down.
        let leftovers: Vec<Arc<WorkerProcess>> = self
            .shared
            .registry
            .clear()
            .into_iter()
            .map(|instance| instance.process)
            .chain(self.shared.take_stragglers())
            .collect();
        if !leftovers.is_empty() {
            self.shutdown_processes(&leftovers, false).await;
        }

        let session = self.session.lock().expect("executor session poisoned").take();
        if let Some(session) = session {
            debug!("stopping event listener");
            let _ = session.shutdown_tx.send(true);
            if let Err(e) = session.listener.await {
                warn!("event listener ended abnormally: {e}");
            }
            debug!("closing event channel");
            session.channel.close();
        }

        self.state.store(STOPPED, Ordering::SeqCst);
        info!("executor stopped");
        Ok(())
    }

    /// Join every process, retrying until none is alive.
    async fn shutdown_processes(&self, processes: &[Arc<WorkerProcess>], wait: bool) {
        let config = &self.shared.config.executor;
        let join_timeout = config.teardown_join_timeout();
        let force_after = if wait { config.teardown_force_after } else { Some(0) };

        let mut round: u32 = 0;
        loop {
            let mut alive = Vec::new();
            for process in processes {
                if process.is_alive().await {
                    alive.push(process);
                } else {
                    // Best effort: already closed or never started is fine.
                    let _ = process.close().await;
                }
            }
            if alive.is_empty() {
                break;
            }

            let forcing = force_after.is_some_and(|n| round >= n);
            debug!(round, alive = alive.len(), forcing, "joining worker processes");

            for process in alive {
                if forcing {
                    // SIGTERM on the first forced round, SIGKILL afterwards.
                    let signalled = if force_after == Some(round) {
                        process.terminate().await
                    } else {
                        process.kill().await
                    };
                    if let Err(e) = signalled {
                        warn!(process = %process.name(), "signal failed: {e}");
                    }
                }
                if process.join(join_timeout).await {
                    let _ = process.close().await;
                } else if forcing {
                    warn!(process = %process.name(), pid = ?process.pid(), "still alive; will try again");
                } else {
                    debug!(process = %process.name(), "still running; waiting");
                }
            }
            round = round.saturating_add(1);
        }
    }

    /// Start one run of `job` in a fresh worker process.
    ///
    /// Dynamic args are evaluated now. Fails with `MaxInstancesExceeded`
    /// without side effects when the job is at its cap, and with `Spawn`
    /// (after deregistering the instance) when the worker cannot start.
    /// Fails with `NotRunning` if teardown begins before the instance is
    /// registered.
    pub async fn submit_job(&self, job: &Job, run_time: DateTime<Utc>) -> Result<InstanceId> {
        let (session, event_addr) = self.session_endpoint()?;

        let kwargs = job.resolve_kwargs();
        let instance_id = self.ids.allocate_instance_id();
        let process = Arc::new(WorkerProcess::pending(format!("Process-{instance_id}")));

        {
            let reservation = self.shared.registry.check_and_reserve(job)?;
            // Teardown may have begun while dynamic args were evaluated. It
            // leaves RUNNING before clearing the registry under this lock.
            if !self.is_running() {
                return Err(ExecutorError::NotRunning);
            }
            reservation.register(instance_id, Utc::now(), Arc::clone(&process));
        }

        info!(job_id = %job.id, %instance_id, %run_time, "running job");

        let request = WorkerRequest {
            session,
            event_addr,
            job_id: job.id.clone(),
            func: job.func.clone(),
            instance_id,
            run_time,
            args: job.args.clone(),
            kwargs,
        };

        if let Err(source) = self.spawn_worker(&process, &request).await {
            error!(job_id = %job.id, %instance_id, "worker failed to start: {source}");
            self.shared.cleanup_instance(&job.id, instance_id, true).await;
            return Err(ExecutorError::Spawn {
                job_id: job.id.clone(),
                instance_id,
                source,
            });
        }

        Ok(instance_id)
    }

    async fn spawn_worker(&self, process: &WorkerProcess, request: &WorkerRequest) -> io::Result<()> {
        let worker = &self.shared.config.worker;
        let payload = serde_json::to_vec(request)?;

        // Workers never write to our stdout/stderr.
        let mut child = Command::new(worker.resolve_program())
            .args(&worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();

        if !process.attach(child).await {
            return Err(io::Error::other("instance was cleaned up while spawning"));
        }
        debug!(process = %process.name(), pid = ?process.pid(), "worker spawned");

        let mut stdin = stdin.ok_or_else(|| io::Error::other("worker stdin unavailable"))?;
        stdin.write_all(&payload).await?;
        stdin.shutdown().await?;
        Ok(())
    }

    /// Forcefully stop one instance and return the id of its job.
    pub async fn terminate_job(&self, instance_id: InstanceId) -> Result<String> {
        self.ensure_running()?;
        let instance = self.shared.registry.lookup(instance_id)?;
        let job_id = instance.job.id.clone();

        info!(%job_id, %instance_id, "terminating job instance");
        self.shared.cleanup_instance(&job_id, instance_id, true).await;
        Ok(job_id)
    }

    pub fn get_job_instance_ids(&self, job_id: &str) -> Result<Vec<InstanceId>> {
        self.ensure_running()?;
        Ok(self.shared.registry.instances_for(job_id))
    }

    pub fn get_job(&self, instance_id: InstanceId) -> Result<Job> {
        self.ensure_running()?;
        Ok(self.shared.registry.lookup(instance_id)?.job)
    }

    pub fn get_instances(&self) -> Result<Vec<JobInstance>> {
        self.ensure_running()?;
        Ok(self.shared.registry.snapshot())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.state.load(Ordering::SeqCst) == STOPPED {
            return;
        }
        let processes: Vec<Arc<WorkerProcess>> = self
            .shared
            .registry
            .clear()
            .into_iter()
            .map(|instance| instance.process)
            .chain(self.shared.take_stragglers())
            .collect();
        warn!(
            live = processes.len(),
            "executor dropped without teardown; killing workers"
        );
        // No runtime to await on here, so workers are killed but not reaped.
        for process in &processes {
            if !process.kill_now() {
                debug!(process = %process.name(), "not killed on drop");
            }
        }
    }
}
