// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod engine_config;
pub mod error;
pub mod job_engine;

pub use engine_config::{EngineConfig, OutputLevel, TestDelay, ThreadPriority};
pub use error::{JobError, Result};
pub use job_engine::container::JobContainer;
pub use job_engine::dispatcher::{DispatcherStats, JobCounters, JobDispatcher};
pub use job_engine::job::{Job, JobCore, JobEvent};
pub use job_engine::server::{JobServer, ServerListener, ServerMode};
pub use job_engine::state::{JobState, ServerState};
