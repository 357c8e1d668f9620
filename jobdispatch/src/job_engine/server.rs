// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use clap::ValueEnum;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::engine_config::{EngineConfig, OutputLevel, ThreadPriority};
use crate::error::{JobError, Result};
use crate::job_engine::job::{catch_job_panic, next_object_id, Job};
use crate::job_engine::lock;
use crate::job_engine::state::{JobState, ServerState};

/// How a server maps jobs onto threads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ServerMode {
    #[default]
    /// One long-lived serving thread runs job after job
    Serving,
    /// A fresh thread is spawned for every job
    SingleJob,
}

/// Receives the lifecycle notifications of a server. The job itself has always been
/// notified before its server notifies the listener.
pub trait ServerListener: Send + Sync {
    fn notify_job_started(&self, server: &JobServer, job: &dyn Job);
    fn notify_job_finished(&self, server: &JobServer, job: &dyn Job);
    fn notify_job_aborted(&self, server: &JobServer, job: &dyn Job);
    /// The server is done with its post-job bookkeeping and can take new work.
    fn notify_server_idle(&self, server: &Arc<JobServer>);
}

struct RunRequest {
    job: Arc<dyn Job>,
    // captured at start so a job keeps reporting to the dispatcher that sent it
    listener: Option<Weak<dyn ServerListener>>,
}

struct ServerInner {
    state: ServerState,
    deactivate_requested: bool,
    listener: Option<Weak<dyn ServerListener>>,
    current_job: Option<Arc<dyn Job>>,
    worker: Option<JoinHandle<()>>,
    job_tx: Option<Sender<RunRequest>>,
}

/// A worker that runs at most one job at a time on its own thread.
pub struct JobServer {
    id: u64,
    mode: ServerMode,
    config: EngineConfig,
    inner: Mutex<ServerInner>,
    job_done: Condvar,
    jobs_run: AtomicU64,
}

impl JobServer {
    pub fn new(config: &EngineConfig, mode: ServerMode) -> Arc<Self> {
        Arc::new(Self {
            id: next_object_id(),
            mode,
            config: config.clone(),
            inner: Mutex::new(ServerInner {
                state: ServerState::Idle,
                deactivate_requested: false,
                listener: None,
                current_job: None,
                worker: None,
                job_tx: None,
            }),
            job_done: Condvar::new(),
            jobs_run: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    pub fn thread_priority(&self) -> ThreadPriority {
        self.config.thread_priority
    }

    pub fn state(&self) -> ServerState {
        lock(&self.inner).state
    }

    pub fn is_idle(&self) -> bool {
        self.state().is_idle()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn current_job_id(&self) -> Option<u64> {
        lock(&self.inner)
            .current_job
            .as_ref()
            .map(|job| job.core().id())
    }

    /// Number of jobs this server has run to a terminal state.
    pub fn jobs_run(&self) -> u64 {
        self.jobs_run.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_listener(&self, listener: Weak<dyn ServerListener>) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner
            .listener
            .as_ref()
            .is_some_and(|current| current.strong_count() > 0)
        {
            return Err(JobError::ServerAlreadyAttached(self.id));
        }
        inner.listener = Some(listener);
        Ok(())
    }

    pub(crate) fn detach_listener(&self) {
        lock(&self.inner).listener = None;
    }

    /// Hands a job to this server. Completion is observed through the job; a
    /// dispatcher the server belongs to does not count it.
    pub fn start_job(self: &Arc<Self>, job: Arc<dyn Job>) -> Result<()> {
        self.start(job, false)
    }

    /// Starts a job sent through the attached dispatcher, which then receives the
    /// started, finished and aborted notifications for it.
    pub(crate) fn start_dispatched_job(self: &Arc<Self>, job: Arc<dyn Job>) -> Result<()> {
        self.start(job, true)
    }

    fn start(self: &Arc<Self>, job: Arc<dyn Job>, dispatched: bool) -> Result<()> {
        let mut inner = lock(&self.inner);
        match inner.state {
            ServerState::Idle => {}
            ServerState::Executing => return Err(JobError::ServerBusy(self.id)),
            ServerState::Uninitialized | ServerState::Inactive => {
                return Err(JobError::ServerInactive(self.id))
            }
        }
        inner.state = ServerState::Executing;
        inner.current_job = Some(job.clone());
        let request = RunRequest {
            job,
            listener: if dispatched {
                inner.listener.clone()
            } else {
                None
            },
        };

        let started = match self.mode {
            ServerMode::Serving => self.start_job_by_server(&mut inner, request),
            ServerMode::SingleJob => self.start_single_job(&mut inner, request),
        };
        if started.is_err() {
            inner.state = ServerState::Idle;
            inner.current_job = None;
        }
        started
    }

    /// Starts the job and blocks until it reached a terminal state and the server
    /// is done with it.
    pub fn run_job_synchronous(self: &Arc<Self>, job: Arc<dyn Job>) -> Result<JobState> {
        let job_id = job.core().id();
        self.start_job(job.clone())?;
        job.core().wait_job_completion(None);
        self.wait_job_released(job_id, None);
        Ok(job.core().state())
    }

    /// Blocks until the server no longer holds the given job. Returns false if the
    /// timeout elapsed first.
    pub fn wait_job_released(&self, job_id: u64, timeout: Option<Duration>) -> bool {
        let holds_job = |inner: &mut ServerInner| {
            inner
                .current_job
                .as_ref()
                .is_some_and(|job| job.core().id() == job_id)
        };
        let inner = lock(&self.inner);
        match timeout.filter(|t| !t.is_zero()) {
            None => {
                let _inner = self
                    .job_done
                    .wait_while(inner, holds_job)
                    .unwrap_or_else(PoisonError::into_inner);
                true
            }
            Some(timeout) => {
                let (mut inner, _) = self
                    .job_done
                    .wait_timeout_while(inner, timeout, holds_job)
                    .unwrap_or_else(PoisonError::into_inner);
                !holds_job(&mut *inner)
            }
        }
    }

    fn start_job_by_server(
        self: &Arc<Self>,
        inner: &mut ServerInner,
        request: RunRequest,
    ) -> Result<()> {
        let serving = inner.job_tx.as_ref().is_some_and(|tx| !tx.is_closed())
            && inner.worker.as_ref().is_some_and(|h| !h.is_finished());
        if !serving {
            let (tx, rx) = async_channel::unbounded();
            let server = Arc::downgrade(self);
            let handle = thread::Builder::new()
                .name(format!("job-server-{}", self.id))
                .spawn(move || serve(server, rx))?;
            if self.config.traces(OutputLevel::Normal) {
                info!(
                    "Started serving thread of job server {} (priority {:?})",
                    self.id, self.config.thread_priority
                );
            }
            if let Some(previous) = inner.worker.replace(handle) {
                if previous.is_finished() {
                    let _ = previous.join();
                }
            }
            inner.job_tx = Some(tx);
        }
        let tx = inner
            .job_tx
            .as_ref()
            .ok_or(JobError::ServerThreadGone(self.id))?;
        tx.try_send(request)
            .map_err(|_| JobError::ServerThreadGone(self.id))
    }

    fn start_single_job(
        self: &Arc<Self>,
        inner: &mut ServerInner,
        request: RunRequest,
    ) -> Result<()> {
        let server = self.clone();
        let handle = thread::Builder::new()
            .name(format!("job-server-{}", self.id))
            .spawn(move || server.run_job_in_thread(request))?;
        // the previous thread is past its job; join it if it already ended
        if let Some(previous) = inner.worker.replace(handle) {
            if previous.is_finished() {
                let _ = previous.join();
            }
        }
        Ok(())
    }

    fn run_job_in_thread(self: &Arc<Self>, request: RunRequest) {
        let RunRequest { job, listener } = request;
        let listener = listener.and_then(|l| l.upgrade());
        let core = job.core();

        match core.notify_job_started() {
            Err(e) => {
                error!("Job server {} cannot start job {}: {e}", self.id, core.id());
                if let Some(listener) = &listener {
                    listener.notify_job_aborted(self, job.as_ref());
                }
            }
            Ok(()) => {
                if let Some(listener) = &listener {
                    listener.notify_job_started(self, job.as_ref());
                }
                match catch_job_panic(|| job.run_job_defined()) {
                    Ok(()) => match core.notify_job_finished() {
                        Ok(()) => {
                            if let Some(listener) = &listener {
                                listener.notify_job_finished(self, job.as_ref());
                            }
                        }
                        Err(e) => error!("Job server {}: {e}", self.id),
                    },
                    Err(e) => {
                        if core.state() == JobState::Executing {
                            warn!("Job {} aborted on job server {}: {e:#}", core.id(), self.id);
                            if core.notify_job_aborted(Some(e)).is_ok() {
                                if let Some(listener) = &listener {
                                    listener.notify_job_aborted(self, job.as_ref());
                                }
                            }
                        }
                    }
                }
            }
        }
        self.jobs_run.fetch_add(1, Ordering::SeqCst);

        let (idle, owner) = {
            let mut inner = lock(&self.inner);
            inner.current_job = None;
            let owner = inner.listener.as_ref().and_then(|l| l.upgrade());
            if inner.deactivate_requested {
                inner.deactivate_requested = false;
                inner.state = ServerState::Inactive;
                (false, owner)
            } else {
                inner.state = ServerState::Idle;
                (true, owner)
            }
        };
        self.job_done.notify_all();
        // jobs started directly have no listener, but the owning dispatcher still
        // gets the server back
        if idle {
            if let Some(listener) = listener.as_ref().or(owner.as_ref()) {
                listener.notify_server_idle(self);
            }
        }
    }

    /// Asks the serving thread to exit once it ran the jobs already handed to it.
    pub fn stop_server_thread(&self) {
        if let Some(tx) = lock(&self.inner).job_tx.take() {
            tx.close();
        }
    }

    /// Waits for the current worker thread to end.
    pub fn join_server_thread(&self) {
        let handle = lock(&self.inner).worker.take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Thread of job server {} panicked", self.id);
            }
        }
    }

    /// Stops the server for good: no new jobs are accepted and the serving thread
    /// exits. A job that is already running is not interrupted.
    pub fn kill_server_thread(&self) {
        self.deactivate();
        self.stop_server_thread();
    }

    /// Moves the server to Inactive, after the current job if there is one.
    pub fn deactivate(&self) {
        let mut inner = lock(&self.inner);
        match inner.state {
            ServerState::Executing => inner.deactivate_requested = true,
            _ => inner.state = ServerState::Inactive,
        }
    }

    /// Makes an inactive server available again.
    pub fn activate(self: &Arc<Self>) {
        let listener = {
            let mut inner = lock(&self.inner);
            inner.deactivate_requested = false;
            if matches!(inner.state, ServerState::Inactive | ServerState::Uninitialized) {
                inner.state = ServerState::Idle;
                inner.listener.as_ref().and_then(|l| l.upgrade())
            } else {
                None
            }
        };
        if let Some(listener) = listener {
            listener.notify_server_idle(self);
        }
    }
}

fn serve(server: Weak<JobServer>, rx: Receiver<RunRequest>) {
    while let Ok(request) = rx.recv_blocking() {
        match server.upgrade() {
            Some(server) => server.run_job_in_thread(request),
            None => break,
        }
    }
    log::debug!("Serving thread {:?} exiting", thread::current().name());
}

impl std::fmt::Debug for JobServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobServer")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("jobs_run", &self.jobs_run())
            .finish()
    }
}
