// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Parallel Job Dispatch on OS Threads
//!
//! ## Overview
//! - A `JobContainer` owns one unit of work: input, work function, result, state.
//! - A `JobServer` runs at most one job at a time on its own thread, either a
//!   long-lived serving thread or a fresh thread per job.
//! - A `JobDispatcher` owns the servers, an idle pool and a FIFO backlog. Every sent
//!   job goes to the backlog; a background thread pairs queued jobs with idle
//!   servers in submission order.
//! - Completion is signalled through condition variables, never by polling.
//! - Stopping is cooperative. A running work function is never interrupted.
//!
//! ## Notifications
//! The server notifies the job first and its dispatcher second, for started,
//! finished and aborted alike. The dispatcher keeps its counters and idle pool
//! behind a dedicated servers lock, so a server never needs the dispatcher's
//! queue lock and never holds its own lock while calling into the dispatcher.
//!
//! ```text
//!         +----------------------------------------+
//!         |             JobDispatcher              |
//!         |   backlog (FIFO)       idle pool       |
//!         +----------+-----------------------------+
//!                    |  dispatcher thread
//!          +---------+---------+
//!          v                   v
//!     +----------+        +----------+
//!     | Server 1 |  ...   | Server K |
//!     +----+-----+        +----+-----+
//!          |                   |
//!          v                   v
//!     JobContainer        JobContainer
//!     (Executing ->       (Executing ->
//!      ResultsReady)       Aborted)
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod container;
pub mod dispatcher;
pub mod job;
pub mod server;
pub mod state;

// A panicking user callback must not wedge the engine, so poisoned locks are
// taken over as they are.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
