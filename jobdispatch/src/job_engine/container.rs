// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::ops::Deref;
use std::sync::Mutex;

use anyhow::anyhow;
use log::warn;

use crate::engine_config::EngineConfig;
use crate::error::{JobError, Result};
use crate::job_engine::job::{catch_job_panic, Job, JobCore};
use crate::job_engine::lock;
use crate::job_engine::state::JobState;

pub type EvaluationFn<I, R> = Box<dyn Fn(&I) -> anyhow::Result<R> + Send + Sync + 'static>;

/// A job that evaluates a work function on a typed input and keeps the typed result.
///
/// The container dereferences to its [`JobCore`], so state, ids, callbacks and
/// waiting are available directly on it.
pub struct JobContainer<I, R> {
    core: JobCore,
    desc: String,
    evaluation: Option<EvaluationFn<I, R>>,
    input: Mutex<Option<I>>,
    result: Mutex<Option<R>>,
}

impl<I, R> JobContainer<I, R>
where
    I: Send + 'static,
    R: Send + 'static,
{
    pub fn new<F>(evaluation: F) -> Self
    where
        F: Fn(&I) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self::with_config(&EngineConfig::default(), evaluation)
    }

    pub fn with_config<F>(config: &EngineConfig, evaluation: F) -> Self
    where
        F: Fn(&I) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self {
            core: JobCore::new(JobState::Initialized, config),
            desc: "job container".to_string(),
            evaluation: Some(Box::new(evaluation)),
            input: Mutex::new(None),
            result: Mutex::new(None),
        }
    }

    /// A container without work attached. Running it fails with `JobNotDefined`.
    pub fn unemployed(config: &EngineConfig) -> Self {
        Self {
            core: JobCore::new(JobState::Unemployed, config),
            desc: "unemployed job container".to_string(),
            evaluation: None,
            input: Mutex::new(None),
            result: Mutex::new(None),
        }
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    /// Builder form of [`set_input`](Self::set_input). Input given after the job
    /// left DataReady is dropped with a warning.
    pub fn with_input(self, input: I) -> Self {
        if let Err(e) = self.set_input(input) {
            warn!("Ignoring input for job {}: {e}", self.core.id());
        }
        self
    }

    /// Replaces the input. Only allowed until the job is handed to a dispatcher.
    pub fn set_input(&self, input: I) -> Result<()> {
        let state = self.core.state();
        if state > JobState::DataReady {
            return Err(JobError::InputLocked {
                job_id: self.core.id(),
                state,
            });
        }
        *lock(&self.input) = Some(input);
        if self.evaluation.is_some() {
            self.core.set_data_ready()?;
        }
        Ok(())
    }

    pub fn is_job_defined(&self) -> bool {
        self.evaluation.is_some()
    }

    pub fn input(&self) -> Option<I>
    where
        I: Clone,
    {
        lock(&self.input).clone()
    }

    pub fn result(&self) -> Option<R>
    where
        R: Clone,
    {
        lock(&self.result).clone()
    }

    pub fn take_result(&self) -> Option<R> {
        lock(&self.result).take()
    }

    /// Runs the job on the calling thread, moving it through Executing to
    /// ResultsReady, or to Aborted if the work function fails.
    pub fn run_job(&self) -> Result<()> {
        if self.evaluation.is_none() {
            return Err(JobError::JobNotDefined(self.core.id()));
        }
        self.core.notify_job_started()?;
        match catch_job_panic(|| self.evaluate()) {
            Ok(()) => self.core.notify_job_finished(),
            Err(e) => {
                let message = format!("{e:#}");
                self.core.notify_job_aborted(Some(e))?;
                Err(JobError::Execution(anyhow!(message)))
            }
        }
    }

    /// Sets the input, runs the job on the calling thread and returns its result.
    pub fn run_job_with(&self, input: I) -> Result<R>
    where
        R: Clone,
    {
        self.set_input(input)?;
        self.run_job()?;
        self.result().ok_or_else(|| {
            JobError::Execution(anyhow!("job {} produced no result", self.core.id()))
        })
    }

    fn evaluate(&self) -> anyhow::Result<()> {
        let evaluation = self
            .evaluation
            .as_ref()
            .ok_or_else(|| anyhow!("no evaluation function attached"))?;
        if let Some(delay) = self.core.test_delay() {
            delay.apply();
        }
        let input = lock(&self.input);
        let input = input
            .as_ref()
            .ok_or_else(|| anyhow!("job {} has no input", self.core.id()))?;
        let result = evaluation(input)?;
        *lock(&self.result) = Some(result);
        Ok(())
    }
}

impl<I, R> Job for JobContainer<I, R>
where
    I: Send + 'static,
    R: Send + 'static,
{
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn desc(&self) -> &str {
        &self.desc
    }

    fn is_job_defined(&self) -> bool {
        JobContainer::is_job_defined(self)
    }

    fn run_job_defined(&self) -> anyhow::Result<()> {
        self.evaluate()
    }
}

impl<I, R> Deref for JobContainer<I, R> {
    type Target = JobCore;

    fn deref(&self) -> &JobCore {
        &self.core
    }
}

impl<I, R> std::fmt::Debug for JobContainer<I, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContainer")
            .field("desc", &self.desc)
            .field("core", &self.core)
            .field("defined", &self.evaluation.is_some())
            .finish()
    }
}
