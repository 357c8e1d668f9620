// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;

use jobdispatch::{DispatcherStats, JobDispatcher, JobState};
use serde::{Deserialize, Serialize};

use crate::sine::SineJob;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub client_job_id: i64,
    pub dispatcher_job_id: Option<u64>,
    pub state: JobState,
    pub result: Option<f64>,
    pub error: Option<String>,
}

/// Outcome of a scenario run, written out when a test wants to keep it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScenarioLog {
    pub name: String,
    pub stats: DispatcherStats,
    pub jobs: Vec<JobRecord>,
}

impl ScenarioLog {
    pub fn capture(name: &str, dispatcher: &JobDispatcher, jobs: &[Arc<SineJob>]) -> Self {
        Self {
            name: name.to_string(),
            stats: dispatcher.stats(),
            jobs: jobs
                .iter()
                .map(|job| JobRecord {
                    client_job_id: job.client_job_id(),
                    dispatcher_job_id: job.dispatcher_job_id(),
                    state: job.state(),
                    result: job.result(),
                    error: job.error_message(),
                })
                .collect(),
        }
    }

    pub fn count_in(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|job| job.state == state).count()
    }
}
