// SPDX-License-Identifier: MIT
// sine-dispatch: load test for the job dispatcher
//
// - Samples sin(x) on [0, 2π] with one job per sample point.
// - Runs the jobs on a dispatcher with a configurable number of servers.
// - Optionally injects synthetic delays and failures.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use jobdispatch::{
    DispatcherStats, EngineConfig, JobContainer, JobDispatcher, JobState, OutputLevel,
    ServerMode, TestDelay, ThreadPriority,
};
use log::{info, warn};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Number of job servers
    #[arg(long, default_value_t = 4)]
    servers: usize,

    /// Number of sample points, one job each
    #[arg(long, default_value_t = 100)]
    jobs: usize,

    /// How servers map jobs onto threads
    #[arg(long, value_enum, default_value_t)]
    mode: ServerMode,

    /// Synthetic delay per job in milliseconds. Switches test mode on.
    #[arg(long = "test-delay-ms", value_name = "MS")]
    test_delay_ms: Option<u64>,

    /// Relative spread of the synthetic delay, between 0 and 1
    #[arg(long, default_value_t = 0.0)]
    relative_error: f64,

    /// Let the work function fail for every odd sample index
    #[arg(long)]
    fail_odd: bool,

    /// Engine verbosity [default: normal]
    #[arg(long, value_enum)]
    output_level: Option<OutputLevel>,

    /// Requested worker thread priority [default: normal]
    #[arg(long, value_enum)]
    thread_priority: Option<ThreadPriority>,

    /// Hand jobs to idle servers directly instead of always queueing them
    #[arg(long)]
    dispatch_on_submit: bool,

    /// Give up waiting after this many seconds (0 waits forever)
    #[arg(long, default_value_t = 0)]
    timeout_secs: u64,

    /// Engine configuration (JSON). Command line options override it.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Sample {
    index: usize,
    x: f64,
    state: JobState,
    result: Option<f64>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Report {
    completed: bool,
    elapsed_ms: u128,
    max_abs_error: f64,
    stats: DispatcherStats,
    samples: Vec<Sample>,
}

fn validate_args(args: &Args) -> Result<(), String> {
    if args.servers == 0 {
        return Err("--servers must be at least 1".into());
    }
    if !(0.0..=1.0).contains(&args.relative_error) {
        return Err("--relative-error must be between 0 and 1".into());
    }
    if args.relative_error > 0.0 && args.test_delay_ms.is_none() {
        return Err("--relative-error requires --test-delay-ms".into());
    }
    Ok(())
}

fn engine_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid engine configuration in {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(output_level) = args.output_level {
        config.output_level = output_level;
    }
    if let Some(thread_priority) = args.thread_priority {
        config.thread_priority = thread_priority;
    }
    config.dispatch_on_submit |= args.dispatch_on_submit;
    if let Some(delay_ms) = args.test_delay_ms {
        config.is_test_mode = true;
        config.test_delay = TestDelay::new(1, delay_ms, args.relative_error)?;
    }
    config.validate()?;
    Ok(config)
}

fn sine_job(
    config: &EngineConfig,
    index: usize,
    x: f64,
    fail_odd: bool,
) -> Arc<JobContainer<(usize, f64), f64>> {
    let job = JobContainer::with_config(config, move |(index, x): &(usize, f64)| {
        if fail_odd && index % 2 == 1 {
            anyhow::bail!("sample {index} rejected on purpose");
        }
        Ok(x.sin())
    })
    .with_desc(format!("sin(x_{index})"))
    .with_input((index, x));
    job.set_client_job_id(index as i64);
    Arc::new(job)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }
    let config = engine_config(&args)?;

    let dispatcher = JobDispatcher::with_servers(&config, args.servers, args.mode)?;
    info!(
        "Evaluating {} samples on {} {:?} servers",
        args.jobs, args.servers, args.mode
    );

    let step = if args.jobs > 1 {
        2.0 * std::f64::consts::PI / (args.jobs - 1) as f64
    } else {
        0.0
    };
    let started = Instant::now();
    let jobs: Vec<_> = (0..args.jobs)
        .map(|i| sine_job(&config, i, i as f64 * step, args.fail_odd))
        .collect();
    for job in &jobs {
        dispatcher.send_job(job.clone())?;
    }

    let timeout = (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs));
    let completed = dispatcher.stop_server_when_all_jobs_done(timeout)?;
    let elapsed = started.elapsed();
    if !completed {
        warn!("Timed out with {} jobs outstanding", dispatcher.num_uncompleted_jobs()?);
    }

    let samples: Vec<Sample> = jobs
        .iter()
        .map(|job| {
            let (index, x) = job.input().unwrap_or_default();
            Sample {
                index,
                x,
                state: job.state(),
                result: job.result(),
                error: job.error_message(),
            }
        })
        .collect();
    let max_abs_error = samples
        .iter()
        .filter_map(|s| s.result.map(|r| (r - s.x.sin()).abs()))
        .fold(0.0, f64::max);

    let report = Report {
        completed,
        elapsed_ms: elapsed.as_millis(),
        max_abs_error,
        stats: dispatcher.stats(),
        samples,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let counters = report.stats.counters;
        println!(
            "completed: {}  elapsed: {} ms  sent: {}  finished: {}  aborted: {}  max |error|: {:e}",
            report.completed,
            report.elapsed_ms,
            counters.sent,
            counters.finished,
            counters.aborted,
            report.max_abs_error
        );
    }
    Ok(())
}
