// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::engine_config::{EngineConfig, OutputLevel};
use crate::error::{JobError, Result};
use crate::job_engine::job::{next_object_id, Job};
use crate::job_engine::lock;
use crate::job_engine::server::{JobServer, ServerListener, ServerMode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub sent: u64,
    pub started: u64,
    pub finished: u64,
    pub aborted: u64,
}

impl JobCounters {
    /// Jobs sent but neither finished nor aborted. A negative value means a
    /// notification was counted twice and is reported as an error.
    pub fn uncompleted(&self) -> Result<u64> {
        self.sent
            .checked_sub(self.finished + self.aborted)
            .ok_or(JobError::NegativeUncompleted {
                sent: self.sent,
                finished: self.finished,
                aborted: self.aborted,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub dispatcher_id: u64,
    pub counters: JobCounters,
    pub queued_jobs: usize,
    pub servers: usize,
    pub idle_servers: usize,
    pub idle_pool_rebuilds: u64,
    pub dispatching: bool,
}

// Guarded by the servers lock. Server notifications only ever take this lock.
// Lock order: job queue, then servers, then a server's own lock.
struct ServersBook {
    job_servers: Vec<Arc<JobServer>>,
    idle_job_servers: Vec<Arc<JobServer>>,
    counters: JobCounters,
    idle_pool_rebuilds: u64,
}

impl ServersBook {
    fn is_registered(&self, server: &Arc<JobServer>) -> bool {
        self.job_servers.iter().any(|s| Arc::ptr_eq(s, server))
    }

    fn is_pooled(&self, server: &Arc<JobServer>) -> bool {
        self.idle_job_servers.iter().any(|s| Arc::ptr_eq(s, server))
    }
}

struct DispatcherShared {
    id: u64,
    config: EngineConfig,
    next_dispatcher_job_id: AtomicU64,
    job_queue: Mutex<VecDeque<Arc<dyn Job>>>,
    servers: Mutex<ServersBook>,
    progress: Condvar,
    wakeup: Mutex<bool>,
    wakeup_signal: Condvar,
    stop_requested: AtomicBool,
}

/// Owns a pool of job servers and a FIFO backlog. A background thread hands queued
/// jobs to idle servers in submission order.
pub struct JobDispatcher {
    shared: Arc<DispatcherShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl JobDispatcher {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = Self {
            shared: Arc::new(DispatcherShared {
                id: next_object_id(),
                config: config.clone(),
                next_dispatcher_job_id: AtomicU64::new(0),
                job_queue: Mutex::new(VecDeque::new()),
                servers: Mutex::new(ServersBook {
                    job_servers: Vec::new(),
                    idle_job_servers: Vec::new(),
                    counters: JobCounters::default(),
                    idle_pool_rebuilds: 0,
                }),
                progress: Condvar::new(),
                wakeup: Mutex::new(false),
                wakeup_signal: Condvar::new(),
                stop_requested: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        };
        dispatcher.ensure_dispatch_thread()?;
        Ok(dispatcher)
    }

    /// Creates a dispatcher together with `count` servers of the given mode.
    pub fn with_servers(config: &EngineConfig, count: usize, mode: ServerMode) -> Result<Self> {
        let dispatcher = Self::new(config)?;
        for _ in 0..count {
            dispatcher.add_server(JobServer::new(config, mode))?;
        }
        Ok(dispatcher)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn add_server(&self, server: Arc<JobServer>) -> Result<()> {
        if self.shared.servers().is_registered(&server) {
            return Err(JobError::ServerAlreadyAttached(server.id()));
        }
        let shared: Weak<DispatcherShared> = Arc::downgrade(&self.shared);
        let listener: Weak<dyn ServerListener> = shared;
        server.attach_listener(listener)?;
        {
            let mut book = self.shared.servers();
            if server.is_idle() {
                book.idle_job_servers.push(server.clone());
            }
            book.job_servers.push(server.clone());
        }
        if self.shared.config.traces(OutputLevel::Normal) {
            info!("Added job server {} to dispatcher {}", server.id(), self.shared.id);
        }
        self.shared.wake();
        Ok(())
    }

    /// Removes the server from this dispatcher. A job it is running still reports
    /// back here when it ends.
    pub fn remove_server(&self, server: &Arc<JobServer>) -> Result<()> {
        {
            let mut book = self.shared.servers();
            if !book.is_registered(server) {
                return Err(JobError::UnknownServer(server.id()));
            }
            book.job_servers.retain(|s| !Arc::ptr_eq(s, server));
            book.idle_job_servers.retain(|s| !Arc::ptr_eq(s, server));
        }
        server.detach_listener();
        if self.shared.config.traces(OutputLevel::Normal) {
            info!("Removed job server {} from dispatcher {}", server.id(), self.shared.id);
        }
        Ok(())
    }

    pub fn servers(&self) -> Vec<Arc<JobServer>> {
        self.shared.servers().job_servers.clone()
    }

    /// Queues a job. Returns whether the job was handed to a server right away,
    /// which only happens with `dispatch_on_submit`.
    pub fn send_job(&self, job: Arc<dyn Job>) -> Result<bool> {
        let dispatcher_job_id = self
            .shared
            .next_dispatcher_job_id
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        job.core().assign_to_dispatcher(dispatcher_job_id)?;
        self.shared.servers().counters.sent += 1;
        if self.shared.config.traces(OutputLevel::Verbose) {
            debug!(
                "Dispatcher {} received job {} as #{}",
                self.shared.id,
                job.core().id(),
                dispatcher_job_id
            );
        }

        {
            // held across the direct start so it cannot overtake a job the
            // dispatcher thread has already taken from the queue
            let mut queue = self.shared.queue();
            if self.shared.config.dispatch_on_submit && queue.is_empty() {
                if let Some(server) = self.shared.acquire_idle_server() {
                    match server.start_dispatched_job(job.clone()) {
                        Ok(()) => return Ok(true),
                        Err(e) => {
                            warn!(
                                "Direct start of job {} on job server {} failed: {e}",
                                job.core().id(),
                                server.id()
                            );
                            self.shared.release_idle_server(server);
                        }
                    }
                }
            }
            queue.push_back(job);
        }
        self.ensure_dispatch_thread()?;
        self.shared.wake();
        Ok(false)
    }

    /// Blocks until every sent job finished or aborted. `None` or a zero timeout
    /// waits forever. Returns false on timeout.
    pub fn wait_all_jobs_completed(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        let mut book = self.shared.servers();
        loop {
            if book.counters.uncompleted()? == 0 {
                return Ok(true);
            }
            book = match deadline {
                None => self
                    .shared
                    .progress
                    .wait(book)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.shared
                        .progress
                        .wait_timeout(book, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Waits for all jobs, then stops the dispatcher thread. Returns whether all
    /// jobs had completed. Sending a new job restarts the thread.
    pub fn stop_server_when_all_jobs_done(&self, timeout: Option<Duration>) -> Result<bool> {
        let completed = self.wait_all_jobs_completed(timeout)?;
        self.stop_dispatcher_thread();
        Ok(completed)
    }

    /// Stops the dispatcher thread after its current scheduling pass. Queued jobs
    /// stay queued and running jobs are not interrupted.
    pub fn stop_dispatcher_thread(&self) {
        let mut thread = lock(&self.thread);
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.wake();
        if let Some(handle) = thread.take() {
            if handle.join().is_err() {
                error!("Thread of dispatcher {} panicked", self.shared.id);
            }
        }
    }

    pub fn is_dispatching(&self) -> bool {
        let thread = lock(&self.thread);
        thread.as_ref().is_some_and(|h| !h.is_finished())
            && !self.shared.stop_requested.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> JobCounters {
        self.shared.servers().counters
    }

    pub fn num_sent_jobs(&self) -> u64 {
        self.counters().sent
    }

    pub fn num_started_jobs(&self) -> u64 {
        self.counters().started
    }

    pub fn num_finished_jobs(&self) -> u64 {
        self.counters().finished
    }

    pub fn num_aborted_jobs(&self) -> u64 {
        self.counters().aborted
    }

    pub fn num_uncompleted_jobs(&self) -> Result<u64> {
        self.counters().uncompleted()
    }

    pub fn num_queued_jobs(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn num_idle_servers(&self) -> usize {
        self.shared.servers().idle_job_servers.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        let queued_jobs = self.num_queued_jobs();
        let dispatching = self.is_dispatching();
        let book = self.shared.servers();
        DispatcherStats {
            dispatcher_id: self.shared.id,
            counters: book.counters,
            queued_jobs,
            servers: book.job_servers.len(),
            idle_servers: book.idle_job_servers.len(),
            idle_pool_rebuilds: book.idle_pool_rebuilds,
            dispatching,
        }
    }

    fn ensure_dispatch_thread(&self) -> Result<()> {
        let mut thread = lock(&self.thread);
        let running = thread.as_ref().is_some_and(|h| !h.is_finished());
        if running && !self.shared.stop_requested.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = thread.take() {
            // a stop is pending; let the old loop finish first
            self.shared.wake();
            if handle.join().is_err() {
                error!("Thread of dispatcher {} panicked", self.shared.id);
            }
        }
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("job-dispatcher-{}", self.shared.id))
            .spawn(move || shared.dispatch_loop())?;
        *thread = Some(handle);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_idle_pool<T>(&self, f: impl FnOnce(&mut Vec<Arc<JobServer>>) -> T) -> T {
        f(&mut self.shared.servers().idle_job_servers)
    }

    #[cfg(test)]
    pub(crate) fn with_counters<T>(&self, f: impl FnOnce(&mut JobCounters) -> T) -> T {
        f(&mut self.shared.servers().counters)
    }

    #[cfg(test)]
    pub(crate) fn enqueue_without_wakeup(&self, job: Arc<dyn Job>) -> Result<()> {
        let dispatcher_job_id = self
            .shared
            .next_dispatcher_job_id
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        job.core().assign_to_dispatcher(dispatcher_job_id)?;
        self.shared.servers().counters.sent += 1;
        self.shared.queue().push_back(job);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn dispatch_pending(&self) -> Result<usize> {
        self.shared.dispatch_pending()
    }
}

impl Drop for JobDispatcher {
    fn drop(&mut self) {
        self.stop_dispatcher_thread();
        for server in self.servers() {
            server.stop_server_thread();
            server.detach_listener();
        }
    }
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("stats", &self.stats())
            .finish()
    }
}

impl DispatcherShared {
    fn servers(&self) -> MutexGuard<'_, ServersBook> {
        lock(&self.servers)
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Arc<dyn Job>>> {
        lock(&self.job_queue)
    }

    fn wake(&self) {
        *lock(&self.wakeup) = true;
        self.wakeup_signal.notify_all();
    }

    fn wait_for_wakeup(&self, timeout: Duration) {
        let pending = lock(&self.wakeup);
        let (mut pending, _) = self
            .wakeup_signal
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .unwrap_or_else(PoisonError::into_inner);
        *pending = false;
    }

    fn dispatch_loop(self: Arc<Self>) {
        if self.config.traces(OutputLevel::Normal) {
            info!("Dispatcher {} thread started", self.id);
        }
        while !self.stop_requested.load(Ordering::SeqCst) {
            match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_pending())) {
                Ok(Ok(dispatched)) => {
                    if dispatched > 0 && self.config.traces(OutputLevel::Trace) {
                        debug!("Dispatcher {} handed out {} jobs", self.id, dispatched);
                    }
                }
                Ok(Err(e)) => error!("Dispatcher {} scheduling pass failed: {e}", self.id),
                Err(_) => error!("Dispatcher {} scheduling pass panicked", self.id),
            }
            self.wait_for_wakeup(self.config.poll_interval());
        }
        if self.config.traces(OutputLevel::Normal) {
            info!("Dispatcher {} thread stopped", self.id);
        }
    }

    /// Pairs queued jobs with idle servers until one of both runs out. The queue
    /// stays locked from pop to start, so jobs start in submission order.
    fn dispatch_pending(&self) -> Result<usize> {
        let mut queue = self.queue();
        let mut dispatched = 0;
        while !queue.is_empty() {
            let Some(server) = self.acquire_idle_server() else {
                break;
            };
            let Some(job) = queue.pop_front() else {
                self.release_idle_server(server);
                break;
            };
            if let Err(e) = server.start_dispatched_job(job.clone()) {
                queue.push_front(job);
                return Err(e);
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Takes a server from the idle pool. The pool is rebuilt from the servers' own
    /// state if it turns out to disagree with them.
    fn acquire_idle_server(&self) -> Option<Arc<JobServer>> {
        let mut book = self.servers();
        let mut rebuilt = false;
        loop {
            match book.idle_job_servers.pop() {
                Some(server) => {
                    if server.is_idle() && book.is_registered(&server) && !book.is_pooled(&server)
                    {
                        return Some(server);
                    }
                    if !rebuilt {
                        warn!(
                            "Idle pool of dispatcher {} is out of sync, rebuilding it",
                            self.id
                        );
                        Self::rebuild_idle_pool(&mut book);
                        rebuilt = true;
                    }
                }
                None => {
                    if rebuilt || !book.job_servers.iter().any(|s| s.is_idle()) {
                        return None;
                    }
                    debug!("Dispatcher {} found idle servers outside its pool", self.id);
                    Self::rebuild_idle_pool(&mut book);
                    rebuilt = true;
                }
            }
        }
    }

    fn rebuild_idle_pool(book: &mut ServersBook) {
        let idle: Vec<Arc<JobServer>> = book
            .job_servers
            .iter()
            .filter(|s| s.is_idle())
            .cloned()
            .collect();
        book.idle_job_servers = idle;
        book.idle_pool_rebuilds += 1;
    }

    fn release_idle_server(&self, server: Arc<JobServer>) {
        let mut book = self.servers();
        if book.is_registered(&server) && !book.is_pooled(&server) {
            book.idle_job_servers.push(server);
        }
    }
}

impl ServerListener for DispatcherShared {
    fn notify_job_started(&self, server: &JobServer, job: &dyn Job) {
        self.servers().counters.started += 1;
        if self.config.traces(OutputLevel::Verbose) {
            debug!("Job {} started on job server {}", job.core().id(), server.id());
        }
    }

    fn notify_job_finished(&self, server: &JobServer, job: &dyn Job) {
        self.servers().counters.finished += 1;
        self.progress.notify_all();
        if self.config.traces(OutputLevel::Verbose) {
            debug!("Job {} finished on job server {}", job.core().id(), server.id());
        }
    }

    fn notify_job_aborted(&self, server: &JobServer, job: &dyn Job) {
        self.servers().counters.aborted += 1;
        self.progress.notify_all();
        if self.config.traces(OutputLevel::Verbose) {
            debug!("Job {} aborted on job server {}", job.core().id(), server.id());
        }
    }

    fn notify_server_idle(&self, server: &Arc<JobServer>) {
        self.release_idle_server(server.clone());
        self.wake();
    }
}
