// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::time::Duration;

use clap::ValueEnum;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

/// How much the engine reports about its own lifecycle.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Default, Serialize, Deserialize,
)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum OutputLevel {
    /// Only warnings and errors
    Silent,
    #[default]
    /// Server and dispatcher lifecycle
    Normal,
    /// Additionally every job state transition
    Verbose,
    /// Additionally every scheduling pass
    Trace,
}

/// Priority requested for worker threads. The standard library has no portable
/// way to apply it, so it is carried along and reported only.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ThreadPriority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

impl ThreadPriority {
    pub fn value(self) -> i32 {
        match self {
            ThreadPriority::Lowest => -2,
            ThreadPriority::BelowNormal => -1,
            ThreadPriority::Normal => 0,
            ThreadPriority::AboveNormal => 1,
            ThreadPriority::Highest => 2,
        }
    }
}

impl TryFrom<i32> for ThreadPriority {
    type Error = JobError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            -2 => Ok(ThreadPriority::Lowest),
            -1 => Ok(ThreadPriority::BelowNormal),
            0 => Ok(ThreadPriority::Normal),
            1 => Ok(ThreadPriority::AboveNormal),
            2 => Ok(ThreadPriority::Highest),
            other => Err(JobError::InvalidThreadPriority(other)),
        }
    }
}

/// Synthetic delay injected before a job computes its result. Only used in test mode
/// to simulate computations of varying cost.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestDelay {
    pub num_delays: u32,
    pub delay_ms: u64,
    /// Each single delay is scaled by a factor drawn from [1 - e, 1 + e].
    pub relative_error: f64,
}

impl Default for TestDelay {
    fn default() -> Self {
        Self {
            num_delays: 1,
            delay_ms: 50,
            relative_error: 0.0,
        }
    }
}

impl TestDelay {
    pub fn new(num_delays: u32, delay_ms: u64, relative_error: f64) -> Result<Self> {
        let delay = Self {
            num_delays,
            delay_ms,
            relative_error,
        };
        delay.validate()?;
        Ok(delay)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.relative_error) {
            return Err(JobError::InvalidTestDelay(format!(
                "relative error {} is outside of [0, 1]",
                self.relative_error
            )));
        }
        Ok(())
    }

    /// Draws the length of one single delay.
    pub fn sample(&self) -> Duration {
        let nominal = Duration::from_millis(self.delay_ms);
        if self.relative_error <= 0.0 {
            return nominal;
        }
        let e = self.relative_error;
        let factor = 1.0 + rand::thread_rng().gen_range(-e..=e);
        nominal.mul_f64(factor.max(0.0))
    }

    /// Blocks the calling thread for `num_delays` sampled delays.
    pub fn apply(&self) {
        for _ in 0..self.num_delays {
            std::thread::sleep(self.sample());
        }
    }
}

/// Settings handed to every container, server and dispatcher at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output_level: OutputLevel,
    pub is_test_mode: bool,
    /// Upper bound for how long the dispatcher thread sleeps between two
    /// scheduling passes when nobody wakes it up.
    pub poll_interval_ms: u64,
    pub thread_priority: ThreadPriority,
    pub test_delay: TestDelay,
    /// Hand a job straight to an idle server in `send_job` if the backlog is empty.
    pub dispatch_on_submit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_level: OutputLevel::default(),
            is_test_mode: false,
            poll_interval_ms: 10,
            thread_priority: ThreadPriority::default(),
            test_delay: TestDelay::default(),
            dispatch_on_submit: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.test_delay.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn traces(&self, level: OutputLevel) -> bool {
        self.output_level >= level
    }
}
