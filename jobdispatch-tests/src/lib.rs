// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod scenario_log;
pub mod sine;

use jobdispatch::{EngineConfig, OutputLevel};

/// Routes engine logs to the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A configuration that keeps the engine quiet and polls fast.
pub fn quiet_config() -> EngineConfig {
    EngineConfig {
        output_level: OutputLevel::Silent,
        poll_interval_ms: 5,
        ..EngineConfig::default()
    }
}
