// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use thiserror::Error;

use crate::job_engine::state::JobState;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("no evaluation function is attached to job {0}")]
    JobNotDefined(u64),

    #[error("thread priority {0} is outside of -2..=2")]
    InvalidThreadPriority(i32),

    #[error("invalid test delay: {0}")]
    InvalidTestDelay(String),

    #[error("job server {0} is already attached to a dispatcher")]
    ServerAlreadyAttached(u64),

    #[error("job server {0} is not known to this dispatcher")]
    UnknownServer(u64),

    #[error("job {0} has already been assigned to a dispatcher")]
    AlreadyAssigned(u64),

    #[error("input of job {job_id} cannot change in state {state:?}")]
    InputLocked { job_id: u64, state: JobState },

    #[error("completion is undefined in state {0:?}")]
    CompletionUndefined(JobState),

    #[error("invalid job state transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("job server {0} is already executing a job")]
    ServerBusy(u64),

    #[error("job server {0} is inactive")]
    ServerInactive(u64),

    #[error(
        "negative number of uncompleted jobs (sent {sent}, finished {finished}, aborted {aborted})"
    )]
    NegativeUncompleted { sent: u64, finished: u64, aborted: u64 },

    #[error("serving thread of job server {0} is gone")]
    ServerThreadGone(u64),

    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("job execution failed: {0:#}")]
    Execution(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;
