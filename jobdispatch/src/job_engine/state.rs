// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::{Deserialize, Serialize};

/// Lifecycle of a job. The declaration order is the order in which a job moves
/// forward, so comparisons like `state < JobState::DataReady` are meaningful.
#[derive(Clone, Debug, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobState {
    Uninitialized,
    Initialized,
    /// Constructed without work attached.
    Unemployed,
    DataReady,
    EnQueued,
    Executing,
    ResultsReady,
    Aborted,
    ResultsProcessed,
}

impl JobState {
    /// A job in a terminal state will not execute again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::ResultsReady | JobState::Aborted | JobState::ResultsProcessed
        )
    }

    /// Whether asking for completion makes sense in this state.
    pub fn completion_defined(self) -> bool {
        self >= JobState::DataReady && self < JobState::ResultsProcessed
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
    Uninitialized,
    Idle,
    Executing,
    Inactive,
}

impl ServerState {
    pub fn is_active(self) -> bool {
        !matches!(self, ServerState::Uninitialized | ServerState::Inactive)
    }

    pub fn is_idle(self) -> bool {
        self == ServerState::Idle
    }
}
