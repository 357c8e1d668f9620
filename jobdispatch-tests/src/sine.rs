// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::f64::consts::PI;
use std::sync::Arc;

use jobdispatch::{EngineConfig, JobContainer, JobDispatcher};

/// Input is the sample index, the result is sin at that sample point.
pub type SineJob = JobContainer<usize, f64>;

/// The i-th of `count` equidistant points on [0, 2π].
pub fn sample_point(index: usize, count: usize) -> f64 {
    if count < 2 {
        return 0.0;
    }
    2.0 * PI * index as f64 / (count - 1) as f64
}

/// Builds one job per sample point. With `fail_odd` the work function fails for
/// odd indices.
pub fn sine_jobs(config: &EngineConfig, count: usize, fail_odd: bool) -> Vec<Arc<SineJob>> {
    (0..count)
        .map(|index| {
            let job = SineJob::with_config(config, move |index: &usize| {
                if fail_odd && index % 2 == 1 {
                    anyhow::bail!("sample {index} rejected on purpose");
                }
                Ok(sample_point(*index, count).sin())
            })
            .with_desc(format!("sin(x_{index})"))
            .with_input(index);
            job.set_client_job_id(index as i64);
            Arc::new(job)
        })
        .collect()
}

/// Sends all jobs and returns how many of them were started right away.
pub fn send_all(dispatcher: &JobDispatcher, jobs: &[Arc<SineJob>]) -> jobdispatch::Result<usize> {
    let mut started_directly = 0;
    for job in jobs {
        if dispatcher.send_job(job.clone())? {
            started_directly += 1;
        }
    }
    Ok(started_directly)
}

/// Largest deviation of a computed result from sin at its sample point. Jobs
/// without result are skipped.
pub fn max_abs_error(jobs: &[Arc<SineJob>]) -> f64 {
    let count = jobs.len();
    jobs.iter()
        .filter_map(|job| {
            let index = job.input()?;
            let result = job.result()?;
            Some((result - sample_point(index, count).sin()).abs())
        })
        .fold(0.0, f64::max)
}
