// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error};
use serde::Serialize;

use crate::engine_config::{EngineConfig, OutputLevel, TestDelay};
use crate::error::{JobError, Result};
use crate::job_engine::lock;
use crate::job_engine::state::JobState;

// Jobs and servers draw their ids from the same sequence.
static NEXT_OBJECT_ID: Mutex<u64> = Mutex::new(0);

pub(crate) fn next_object_id() -> u64 {
    let mut id = lock(&NEXT_OBJECT_ID);
    *id += 1;
    *id
}

/// Snapshot handed to the lifecycle callbacks of a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: u64,
    pub dispatcher_job_id: Option<u64>,
    pub client_job_id: i64,
    pub state: JobState,
}

/// Lifecycle callback. It runs while the job's lock is held and therefore must not
/// call back into the same job.
pub type JobCallback = Box<dyn Fn(&JobEvent) + Send + Sync + 'static>;

/// A unit of work as seen by servers and dispatchers.
pub trait Job: Send + Sync + 'static {
    /// Identity, state and notifications shared by all jobs
    fn core(&self) -> &JobCore;

    /// Free-form description, used for logging or debugging
    fn desc(&self) -> &str {
        "job"
    }

    /// Whether there is work attached that `run_job_defined` can perform
    fn is_job_defined(&self) -> bool;

    /// Performs the computation on the calling thread. Servers call this between
    /// the started and the finished/aborted notification.
    fn run_job_defined(&self) -> anyhow::Result<()>;
}

impl std::fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.core().id())
            .field("state", &self.core().state())
            .field("desc", &self.desc())
            .finish()
    }
}

#[derive(Default)]
struct Callbacks {
    on_started: Option<JobCallback>,
    on_finished: Option<JobCallback>,
    on_aborted: Option<JobCallback>,
}

struct JobInner {
    state: JobState,
    client_job_id: i64,
    client_data: Option<Box<dyn Any + Send>>,
    test_delay: Option<TestDelay>,
    callbacks: Callbacks,
    error: Option<anyhow::Error>,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
}

/// State shared by every job implementation: identity, lifecycle state guarded by
/// the job's own lock, callbacks and the error captured on abort.
pub struct JobCore {
    id: u64,
    dispatcher_job_id: OnceLock<u64>,
    output_level: OutputLevel,
    inner: Mutex<JobInner>,
    completion: Condvar,
}

impl JobCore {
    pub fn new(state: JobState, config: &EngineConfig) -> Self {
        Self {
            id: next_object_id(),
            dispatcher_job_id: OnceLock::new(),
            output_level: config.output_level,
            inner: Mutex::new(JobInner {
                state,
                client_job_id: 0,
                client_data: None,
                test_delay: config.is_test_mode.then_some(config.test_delay),
                callbacks: Callbacks::default(),
                error: None,
                started_at: None,
                completed_at: None,
            }),
            completion: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sequence number given by the dispatcher the job was sent to.
    pub fn dispatcher_job_id(&self) -> Option<u64> {
        self.dispatcher_job_id.get().copied()
    }

    pub fn client_job_id(&self) -> i64 {
        lock(&self.inner).client_job_id
    }

    pub fn set_client_job_id(&self, client_job_id: i64) {
        lock(&self.inner).client_job_id = client_job_id;
    }

    /// Attaches opaque caller data. The engine never looks at it.
    pub fn set_client_data<T: Any + Send>(&self, data: T) {
        lock(&self.inner).client_data = Some(Box::new(data));
    }

    pub fn client_data<T: Any + Clone>(&self) -> Option<T> {
        lock(&self.inner)
            .client_data
            .as_ref()
            .and_then(|data| data.downcast_ref::<T>())
            .cloned()
    }

    pub fn take_client_data(&self) -> Option<Box<dyn Any + Send>> {
        lock(&self.inner).client_data.take()
    }

    pub fn state(&self) -> JobState {
        lock(&self.inner).state
    }

    /// True iff results are ready. Asking before the job has data, or after its
    /// results were processed, is a programming error.
    pub fn is_job_completed(&self) -> Result<bool> {
        let state = self.state();
        if !state.completion_defined() {
            return Err(JobError::CompletionUndefined(state));
        }
        Ok(state == JobState::ResultsReady)
    }

    pub fn is_test_mode(&self) -> bool {
        lock(&self.inner).test_delay.is_some()
    }

    pub fn test_delay(&self) -> Option<TestDelay> {
        lock(&self.inner).test_delay
    }

    /// `Some` switches test mode on, `None` switches it off.
    pub fn set_test_delay(&self, test_delay: Option<TestDelay>) -> Result<()> {
        if let Some(delay) = &test_delay {
            delay.validate()?;
        }
        lock(&self.inner).test_delay = test_delay;
        Ok(())
    }

    pub fn on_started(&self, callback: impl Fn(&JobEvent) + Send + Sync + 'static) {
        lock(&self.inner).callbacks.on_started = Some(Box::new(callback));
    }

    pub fn on_finished(&self, callback: impl Fn(&JobEvent) + Send + Sync + 'static) {
        lock(&self.inner).callbacks.on_finished = Some(Box::new(callback));
    }

    pub fn on_aborted(&self, callback: impl Fn(&JobEvent) + Send + Sync + 'static) {
        lock(&self.inner).callbacks.on_aborted = Some(Box::new(callback));
    }

    pub fn started_at(&self) -> Option<Instant> {
        lock(&self.inner).started_at
    }

    pub fn completed_at(&self) -> Option<Instant> {
        lock(&self.inner).completed_at
    }

    /// Message of the error that aborted the job.
    pub fn error_message(&self) -> Option<String> {
        lock(&self.inner).error.as_ref().map(|e| format!("{e:#}"))
    }

    pub fn take_error(&self) -> Option<anyhow::Error> {
        lock(&self.inner).error.take()
    }

    /// Blocks until the job reached a terminal state. `None` or a zero timeout waits
    /// forever. Returns false if the timeout elapsed first.
    pub fn wait_job_completion(&self, timeout: Option<Duration>) -> bool {
        let inner = lock(&self.inner);
        match timeout.filter(|t| !t.is_zero()) {
            None => {
                let _inner = self
                    .completion
                    .wait_while(inner, |i| !i.state.is_terminal())
                    .unwrap_or_else(PoisonError::into_inner);
                true
            }
            Some(timeout) => {
                let (inner, _) = self
                    .completion
                    .wait_timeout_while(inner, timeout, |i| !i.state.is_terminal())
                    .unwrap_or_else(PoisonError::into_inner);
                inner.state.is_terminal()
            }
        }
    }

    pub(crate) fn set_data_ready(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state > JobState::DataReady {
            return Err(JobError::InputLocked {
                job_id: self.id,
                state: inner.state,
            });
        }
        inner.state = JobState::DataReady;
        Ok(())
    }

    pub(crate) fn assign_to_dispatcher(&self, dispatcher_job_id: u64) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state >= JobState::EnQueued {
            return Err(JobError::InvalidTransition {
                from: inner.state,
                to: JobState::EnQueued,
            });
        }
        self.dispatcher_job_id
            .set(dispatcher_job_id)
            .map_err(|_| JobError::AlreadyAssigned(self.id))?;
        inner.state = JobState::EnQueued;
        Ok(())
    }

    pub fn notify_job_started(&self) -> Result<()> {
        self.transition(|s| s < JobState::Executing, JobState::Executing, None)
    }

    pub fn notify_job_finished(&self) -> Result<()> {
        self.transition(|s| s == JobState::Executing, JobState::ResultsReady, None)
    }

    pub fn notify_job_aborted(&self, error: Option<anyhow::Error>) -> Result<()> {
        self.transition(|s| s == JobState::Executing, JobState::Aborted, error)
    }

    /// Marks the results as consumed by the caller.
    pub fn mark_results_processed(&self) -> Result<()> {
        self.transition(
            |s| matches!(s, JobState::ResultsReady | JobState::Aborted),
            JobState::ResultsProcessed,
            None,
        )
    }

    fn transition(
        &self,
        allowed: impl Fn(JobState) -> bool,
        to: JobState,
        error: Option<anyhow::Error>,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !allowed(inner.state) {
            return Err(JobError::InvalidTransition {
                from: inner.state,
                to,
            });
        }
        inner.state = to;
        match to {
            JobState::Executing => inner.started_at = Some(Instant::now()),
            JobState::ResultsReady | JobState::Aborted => inner.completed_at = Some(Instant::now()),
            _ => {}
        }
        if error.is_some() {
            inner.error = error;
        }

        let event = JobEvent {
            job_id: self.id,
            dispatcher_job_id: self.dispatcher_job_id(),
            client_job_id: inner.client_job_id,
            state: to,
        };
        if self.output_level >= OutputLevel::Verbose {
            debug!("Job {} ({:?}) is now {:?}", self.id, event.dispatcher_job_id, to);
        }

        let callback = match to {
            JobState::Executing => inner.callbacks.on_started.as_ref(),
            JobState::ResultsReady => inner.callbacks.on_finished.as_ref(),
            JobState::Aborted => inner.callbacks.on_aborted.as_ref(),
            _ => None,
        };
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!("Callback of job {} panicked on {:?}", self.id, to);
            }
        }
        drop(inner);
        self.completion.notify_all();
        Ok(())
    }
}

impl std::fmt::Debug for JobCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCore")
            .field("id", &self.id)
            .field("dispatcher_job_id", &self.dispatcher_job_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Runs `f` and turns a panic into an error, so a failing work function cannot take
/// its thread down.
pub(crate) fn catch_job_panic<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(anyhow::anyhow!("job panicked: {message}"))
        }
    }
}
