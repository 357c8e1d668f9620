use crate::engine_config::{EngineConfig, OutputLevel, TestDelay};
use crate::error::JobError;
use crate::job_engine::container::JobContainer;
use crate::job_engine::dispatcher::{JobCounters, JobDispatcher};
use crate::job_engine::job::{Job, JobEvent};
use crate::job_engine::server::{JobServer, ServerMode};
use crate::job_engine::state::{JobState, ServerState};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quiet_config() -> EngineConfig {
    EngineConfig {
        output_level: OutputLevel::Silent,
        poll_interval_ms: 5,
        ..EngineConfig::default()
    }
}

fn square_job(config: &EngineConfig, x: i64) -> Arc<JobContainer<i64, i64>> {
    Arc::new(JobContainer::with_config(config, |x: &i64| Ok(x * x)).with_input(x))
}

fn sleeping_job(config: &EngineConfig, millis: u64) -> Arc<JobContainer<u64, u64>> {
    Arc::new(
        JobContainer::with_config(config, |ms: &u64| {
            thread::sleep(Duration::from_millis(*ms));
            Ok(*ms)
        })
        .with_input(millis),
    )
}

//
// 1. States
//
#[test]
fn test_job_state_order() {
    assert!(JobState::Uninitialized < JobState::DataReady);
    assert!(JobState::EnQueued < JobState::Executing);
    assert!(JobState::Executing < JobState::ResultsReady);
    assert!(JobState::ResultsReady < JobState::Aborted);
    assert!(JobState::Aborted < JobState::ResultsProcessed);

    assert!(!JobState::Initialized.completion_defined());
    assert!(JobState::DataReady.completion_defined());
    assert!(JobState::Aborted.completion_defined());
    assert!(!JobState::ResultsProcessed.completion_defined());

    assert!(ServerState::Idle.is_active() && ServerState::Idle.is_idle());
    assert!(ServerState::Executing.is_active() && !ServerState::Executing.is_idle());
    assert!(!ServerState::Inactive.is_active());
    assert!(!ServerState::Uninitialized.is_active());
}

#[test]
fn test_completion_window() {
    let config = quiet_config();
    let job: JobContainer<i64, i64> = JobContainer::with_config(&config, |x| Ok(*x));
    assert_eq!(job.state(), JobState::Initialized);
    assert!(matches!(
        job.is_job_completed(),
        Err(JobError::CompletionUndefined(JobState::Initialized))
    ));

    job.set_input(3).unwrap();
    assert_eq!(job.state(), JobState::DataReady);
    assert!(!job.is_job_completed().unwrap());

    job.run_job().unwrap();
    assert!(job.is_job_completed().unwrap());

    job.mark_results_processed().unwrap();
    assert_eq!(job.state(), JobState::ResultsProcessed);
    assert!(job.is_job_completed().is_err());
}

#[test]
fn test_object_ids_are_unique_and_increasing() {
    let config = quiet_config();
    let a = square_job(&config, 1);
    let server = JobServer::new(&config, ServerMode::Serving);
    let b = square_job(&config, 2);
    assert!(a.id() < server.id());
    assert!(server.id() < b.id());
}

//
// 2. Synchronous container runs
//
#[test]
fn test_run_job_with_returns_result_and_fires_callbacks() {
    let config = quiet_config();
    let job: JobContainer<f64, f64> = JobContainer::with_config(&config, |x| Ok(x * 2.0));
    let events: Arc<Mutex<Vec<JobEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let e1 = events.clone();
    job.on_started(move |e| e1.lock().unwrap().push(*e));
    let e2 = events.clone();
    job.on_finished(move |e| e2.lock().unwrap().push(*e));
    job.on_aborted(|_| panic!("must not abort"));
    job.set_client_job_id(42);

    assert_eq!(job.run_job_with(1.5).unwrap(), 3.0);
    assert_eq!(job.state(), JobState::ResultsReady);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].state, JobState::Executing);
    assert_eq!(events[1].state, JobState::ResultsReady);
    assert!(events.iter().all(|e| e.client_job_id == 42 && e.job_id == job.id()));
    assert!(job.started_at().unwrap() <= job.completed_at().unwrap());
}

#[test]
fn test_run_job_without_evaluation_fails() {
    let job: JobContainer<i64, i64> = JobContainer::unemployed(&quiet_config());
    assert_eq!(job.state(), JobState::Unemployed);
    assert!(!job.is_job_defined());
    assert!(matches!(job.run_job(), Err(JobError::JobNotDefined(_))));

    let erased: Arc<dyn Job> = Arc::new(job);
    assert!(!erased.is_job_defined());
    assert!(square_job(&quiet_config(), 1).is_job_defined());
}

#[test]
fn test_late_input_is_ignored() {
    let config = quiet_config();
    let job: JobContainer<i64, i64> = JobContainer::with_config(&config, |x| Ok(*x + 1));
    assert_eq!(job.run_job_with(1).unwrap(), 2);

    let job = job.with_input(10);
    assert_eq!(job.input(), Some(1));
    assert_eq!(job.state(), JobState::ResultsReady);
}

#[test]
fn test_failing_run_aborts_and_keeps_error() {
    let job: JobContainer<i64, i64> =
        JobContainer::with_config(&quiet_config(), |x| anyhow::bail!("cannot handle {x}"));
    let aborted = Arc::new(AtomicUsize::new(0));
    let a = aborted.clone();
    job.on_aborted(move |_| {
        a.fetch_add(1, Ordering::SeqCst);
    });

    let err = job.run_job_with(7).unwrap_err();
    assert!(matches!(err, JobError::Execution(_)));
    assert_eq!(job.state(), JobState::Aborted);
    assert_eq!(aborted.load(Ordering::SeqCst), 1);
    assert_eq!(job.error_message().as_deref(), Some("cannot handle 7"));
    assert!(job.result().is_none());
}

#[test]
fn test_transitions_never_go_back() {
    let config = quiet_config();
    let job = square_job(&config, 4);
    assert!(matches!(
        job.notify_job_finished(),
        Err(JobError::InvalidTransition {
            from: JobState::DataReady,
            to: JobState::ResultsReady
        })
    ));
    job.run_job().unwrap();
    assert!(job.notify_job_started().is_err());
    assert!(job.set_input(5).is_err());
    assert_eq!(job.result(), Some(16));
}

#[test]
fn test_client_data_is_passed_through() {
    let job = square_job(&quiet_config(), 2);
    assert_eq!(job.client_data::<String>(), None);
    job.set_client_data("row 17".to_string());
    assert_eq!(job.client_data::<String>().as_deref(), Some("row 17"));
    assert_eq!(job.client_data::<u32>(), None);
    assert!(job.take_client_data().is_some());
    assert_eq!(job.client_data::<String>(), None);
}

#[test]
fn test_test_mode_delays_the_computation() {
    let config = EngineConfig {
        is_test_mode: true,
        test_delay: TestDelay::new(2, 30, 0.0).unwrap(),
        ..quiet_config()
    };
    let job = square_job(&config, 3);
    assert!(job.is_test_mode());

    let start = Instant::now();
    job.run_job().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(60));

    job.set_test_delay(None).unwrap();
    assert!(!job.is_test_mode());
    assert!(job
        .set_test_delay(Some(TestDelay {
            num_delays: 1,
            delay_ms: 1,
            relative_error: 2.0
        }))
        .is_err());
}

#[test]
fn test_wait_job_completion_timeout() {
    let config = quiet_config();
    let server = JobServer::new(&config, ServerMode::SingleJob);
    let job = sleeping_job(&config, 300);
    server.start_job(job.clone()).unwrap();

    assert!(!job.wait_job_completion(Some(Duration::from_millis(50))));
    assert!(job.wait_job_completion(Some(Duration::from_secs(5))));
    assert_eq!(job.result(), Some(300));
}

//
// 3. Servers
//
#[test]
fn test_serving_thread_runs_jobs_one_after_another() {
    init_log();
    let config = quiet_config();
    let server = JobServer::new(&config, ServerMode::Serving);
    for x in 0..5 {
        let job = square_job(&config, x);
        assert_eq!(
            server.run_job_synchronous(job.clone()).unwrap(),
            JobState::ResultsReady
        );
        assert_eq!(job.result(), Some(x * x));
    }
    assert_eq!(server.jobs_run(), 5);
    assert!(server.is_idle());
    server.stop_server_thread();
    server.join_server_thread();
}

#[test]
fn test_single_job_threads() {
    let config = quiet_config();
    let server = JobServer::new(&config, ServerMode::SingleJob);
    let first = square_job(&config, 6);
    assert_eq!(
        server.run_job_synchronous(first.clone()).unwrap(),
        JobState::ResultsReady
    );
    server.join_server_thread();

    let second = square_job(&config, 7);
    assert_eq!(
        server.run_job_synchronous(second.clone()).unwrap(),
        JobState::ResultsReady
    );
    server.join_server_thread();
    assert_eq!(first.result(), Some(36));
    assert_eq!(second.result(), Some(49));
    assert_eq!(server.state(), ServerState::Idle);
}

#[test]
fn test_busy_server_rejects_second_job() {
    let config = quiet_config();
    let server = JobServer::new(&config, ServerMode::Serving);
    let slow = sleeping_job(&config, 200);
    server.start_job(slow.clone()).unwrap();
    assert_eq!(server.state(), ServerState::Executing);
    assert_eq!(server.current_job_id(), Some(slow.id()));

    let other = square_job(&config, 1);
    assert!(matches!(
        server.start_job(other.clone()),
        Err(JobError::ServerBusy(_))
    ));
    assert_eq!(other.state(), JobState::DataReady);

    assert!(slow.wait_job_completion(None));
    assert!(server.wait_job_released(slow.id(), Some(Duration::from_secs(5))));
    assert!(server.is_idle());
    server.kill_server_thread();
    assert_eq!(server.state(), ServerState::Inactive);
    server.join_server_thread();
}

#[test]
fn test_failing_and_panicking_jobs_abort_without_killing_the_server() {
    init_log();
    let config = quiet_config();
    let server = JobServer::new(&config, ServerMode::Serving);

    let failing: Arc<JobContainer<i64, i64>> = Arc::new(
        JobContainer::with_config(&config, |_| Err(anyhow::anyhow!("bad input"))).with_input(1),
    );
    assert_eq!(
        server.run_job_synchronous(failing.clone()).unwrap(),
        JobState::Aborted
    );
    assert_eq!(failing.error_message().as_deref(), Some("bad input"));

    let panicking: Arc<JobContainer<i64, i64>> = Arc::new(
        JobContainer::with_config(&config, |_| -> anyhow::Result<i64> { panic!("boom") })
            .with_input(1),
    );
    assert_eq!(
        server.run_job_synchronous(panicking.clone()).unwrap(),
        JobState::Aborted
    );
    assert!(panicking.error_message().unwrap().contains("boom"));
    assert!(server.is_idle());

    let fine = square_job(&config, 9);
    assert_eq!(
        server.run_job_synchronous(fine.clone()).unwrap(),
        JobState::ResultsReady
    );
    assert_eq!(fine.result(), Some(81));
}

#[test]
fn test_lost_serving_thread_is_not_a_spawn_failure() {
    let err = JobError::ServerThreadGone(3);
    assert_eq!(err.to_string(), "serving thread of job server 3 is gone");
    assert!(!matches!(err, JobError::ThreadSpawn(_)));
}

#[test]
fn test_deactivated_server_refuses_jobs() {
    let config = quiet_config();
    let server = JobServer::new(&config, ServerMode::Serving);
    server.deactivate();
    assert_eq!(server.state(), ServerState::Inactive);
    assert!(!server.is_active());
    assert!(matches!(
        server.start_job(square_job(&config, 1)),
        Err(JobError::ServerInactive(_))
    ));

    server.activate();
    assert!(server.is_idle());
    let job = square_job(&config, 2);
    assert_eq!(server.run_job_synchronous(job).unwrap(), JobState::ResultsReady);
}

//
// 4. Dispatcher
//
#[test]
fn test_jobs_start_in_submission_order_with_one_server() {
    init_log();
    let config = quiet_config();
    let dispatcher = JobDispatcher::with_servers(&config, 1, ServerMode::Serving).unwrap();
    let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let jobs: Vec<_> = (0..20)
        .map(|i| {
            let job = square_job(&config, i);
            let order = order.clone();
            job.on_started(move |_| order.lock().unwrap().push(i));
            job
        })
        .collect();
    for job in &jobs {
        assert!(!dispatcher.send_job(job.clone()).unwrap());
    }
    assert!(dispatcher
        .wait_all_jobs_completed(Some(Duration::from_secs(10)))
        .unwrap());

    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    for pair in jobs.windows(2) {
        assert!(pair[0].started_at().unwrap() < pair[1].started_at().unwrap());
        assert!(pair[0].dispatcher_job_id().unwrap() < pair[1].dispatcher_job_id().unwrap());
    }
    assert_eq!(dispatcher.num_finished_jobs(), 20);
    assert_eq!(dispatcher.num_started_jobs(), 20);
}

#[test]
fn test_no_job_runs_on_two_servers() {
    let config = quiet_config();
    let dispatcher = JobDispatcher::with_servers(&config, 4, ServerMode::SingleJob).unwrap();
    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..200).map(|_| AtomicUsize::new(0)).collect());
    let active: Arc<Vec<AtomicUsize>> = Arc::new((0..200).map(|_| AtomicUsize::new(0)).collect());
    let overlaps = Arc::new(AtomicUsize::new(0));

    for i in 0..200usize {
        let (runs, active, overlaps) = (runs.clone(), active.clone(), overlaps.clone());
        let job = Arc::new(
            JobContainer::with_config(&config, move |i: &usize| {
                runs[*i].fetch_add(1, Ordering::SeqCst);
                if active[*i].fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_micros(200));
                active[*i].fetch_sub(1, Ordering::SeqCst);
                Ok(*i)
            })
            .with_input(i),
        );
        dispatcher.send_job(job).unwrap();
    }
    assert!(dispatcher
        .wait_all_jobs_completed(Some(Duration::from_secs(30)))
        .unwrap());

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
    let counters = dispatcher.counters();
    assert_eq!(counters.sent, 200);
    assert_eq!(counters.finished, 200);
    assert_eq!(counters.aborted, 0);
    assert_eq!(dispatcher.num_uncompleted_jobs().unwrap(), 0);
}

#[test]
fn test_container_is_notified_before_dispatcher() {
    let config = quiet_config();
    let dispatcher =
        Arc::new(JobDispatcher::with_servers(&config, 1, ServerMode::Serving).unwrap());
    let seen_in_callback = Arc::new(Mutex::new(None));

    let job = square_job(&config, 5);
    let (d, seen) = (dispatcher.clone(), seen_in_callback.clone());
    job.on_finished(move |_| *seen.lock().unwrap() = Some(d.num_finished_jobs()));
    dispatcher.send_job(job.clone()).unwrap();
    assert!(dispatcher.wait_all_jobs_completed(None).unwrap());

    assert_eq!(*seen_in_callback.lock().unwrap(), Some(0));
    assert_eq!(dispatcher.num_finished_jobs(), 1);
}

#[test]
fn test_job_cannot_be_sent_twice() {
    let config = quiet_config();
    let dispatcher = JobDispatcher::with_servers(&config, 1, ServerMode::Serving).unwrap();
    let job = square_job(&config, 3);
    dispatcher.send_job(job.clone()).unwrap();
    assert!(matches!(
        dispatcher.send_job(job.clone()),
        Err(JobError::AlreadyAssigned(_)) | Err(JobError::InvalidTransition { .. })
    ));
    assert!(dispatcher.wait_all_jobs_completed(None).unwrap());
    assert_eq!(dispatcher.num_sent_jobs(), 1);
}

#[test]
fn test_add_and_remove_servers() {
    let config = quiet_config();
    let dispatcher = JobDispatcher::new(&config).unwrap();
    let other = JobDispatcher::new(&config).unwrap();
    let server = JobServer::new(&config, ServerMode::Serving);

    dispatcher.add_server(server.clone()).unwrap();
    assert!(matches!(
        dispatcher.add_server(server.clone()),
        Err(JobError::ServerAlreadyAttached(_))
    ));
    assert!(matches!(
        other.add_server(server.clone()),
        Err(JobError::ServerAlreadyAttached(_))
    ));
    assert_eq!(dispatcher.num_idle_servers(), 1);

    dispatcher.remove_server(&server).unwrap();
    assert_eq!(dispatcher.servers().len(), 0);
    assert_eq!(dispatcher.num_idle_servers(), 0);
    assert!(matches!(
        dispatcher.remove_server(&server),
        Err(JobError::UnknownServer(_))
    ));

    other.add_server(server.clone()).unwrap();
    let job = square_job(&config, 8);
    other.send_job(job.clone()).unwrap();
    assert!(other.wait_all_jobs_completed(None).unwrap());
    assert_eq!(job.result(), Some(64));
}

#[test]
fn test_jobs_wait_in_backlog_until_a_server_is_added() {
    let config = quiet_config();
    let dispatcher = JobDispatcher::new(&config).unwrap();
    let job = square_job(&config, 11);
    dispatcher.send_job(job.clone()).unwrap();
    assert!(!dispatcher
        .wait_all_jobs_completed(Some(Duration::from_millis(50)))
        .unwrap());
    assert_eq!(job.state(), JobState::EnQueued);
    assert_eq!(dispatcher.num_queued_jobs(), 1);

    dispatcher
        .add_server(JobServer::new(&config, ServerMode::Serving))
        .unwrap();
    assert!(dispatcher
        .wait_all_jobs_completed(Some(Duration::from_secs(5)))
        .unwrap());
    assert_eq!(job.result(), Some(121));
}

#[test]
fn test_dispatch_on_submit_starts_immediately() {
    let config = EngineConfig {
        dispatch_on_submit: true,
        ..quiet_config()
    };
    let dispatcher = JobDispatcher::with_servers(&config, 1, ServerMode::Serving).unwrap();
    let slow = sleeping_job(&config, 100);
    assert!(dispatcher.send_job(slow.clone()).unwrap());
    // the only server is busy, so this one has to queue
    let next = square_job(&config, 2);
    assert!(!dispatcher.send_job(next.clone()).unwrap());
    assert!(dispatcher.wait_all_jobs_completed(None).unwrap());
    assert_eq!(next.result(), Some(4));
}

#[test]
fn test_dispatch_on_submit_keeps_submission_order() {
    let config = EngineConfig {
        dispatch_on_submit: true,
        ..quiet_config()
    };
    let dispatcher = JobDispatcher::with_servers(&config, 1, ServerMode::Serving).unwrap();
    let order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let jobs: Vec<_> = (0..30)
        .map(|_| {
            let job = sleeping_job(&config, 1);
            let order = order.clone();
            job.on_started(move |e| order.lock().unwrap().push(e.dispatcher_job_id.unwrap()));
            job
        })
        .collect();
    for job in &jobs {
        dispatcher.send_job(job.clone()).unwrap();
    }
    assert!(dispatcher
        .wait_all_jobs_completed(Some(Duration::from_secs(10)))
        .unwrap());
    assert_eq!(*order.lock().unwrap(), (1..=30).collect::<Vec<u64>>());
}

#[test]
fn test_inconsistent_idle_pool_is_rebuilt() {
    init_log();
    let config = quiet_config();
    let dispatcher = JobDispatcher::with_servers(&config, 2, ServerMode::Serving).unwrap();
    dispatcher.stop_dispatcher_thread();
    let servers = dispatcher.servers();

    // the same server twice in the pool would be handed two jobs
    dispatcher.with_idle_pool(|pool| pool.push(servers[0].clone()));
    assert_eq!(dispatcher.num_idle_servers(), 3);

    let jobs: Vec<_> = (0..3).map(|_| sleeping_job(&config, 300)).collect();
    for job in &jobs {
        dispatcher.enqueue_without_wakeup(job.clone()).unwrap();
    }

    assert_eq!(dispatcher.dispatch_pending().unwrap(), 2);
    assert_eq!(dispatcher.stats().idle_pool_rebuilds, 1);
    assert_eq!(dispatcher.num_queued_jobs(), 1);
    assert!(servers.iter().all(|s| s.state() == ServerState::Executing));
    let mut running: Vec<_> = servers.iter().map(|s| s.current_job_id().unwrap()).collect();
    running.sort();
    assert_eq!(running, vec![jobs[0].id(), jobs[1].id()]);

    // a busy server left in the pool is skipped the same way
    dispatcher.with_idle_pool(|pool| pool.push(servers[1].clone()));
    assert_eq!(dispatcher.dispatch_pending().unwrap(), 0);

    // sending restarts the dispatcher thread, which drains the rest
    let last = square_job(&config, 3);
    dispatcher.send_job(last.clone()).unwrap();
    assert!(dispatcher
        .wait_all_jobs_completed(Some(Duration::from_secs(5)))
        .unwrap());
    assert!(jobs.iter().all(|j| j.state() == JobState::ResultsReady));
    assert_eq!(dispatcher.num_finished_jobs(), 4);
}

#[test]
fn test_negative_uncompleted_count_is_an_error() {
    let config = quiet_config();
    let dispatcher = JobDispatcher::new(&config).unwrap();
    dispatcher.with_counters(|c| c.finished = 1);
    assert!(matches!(
        dispatcher.num_uncompleted_jobs(),
        Err(JobError::NegativeUncompleted {
            sent: 0,
            finished: 1,
            aborted: 0
        })
    ));
    assert!(dispatcher.wait_all_jobs_completed(None).is_err());
}

#[test]
fn test_running_a_dispatcher_server_directly_is_not_counted() {
    let config = quiet_config();
    let dispatcher = JobDispatcher::with_servers(&config, 1, ServerMode::Serving).unwrap();
    let server = dispatcher.servers()[0].clone();

    let direct = square_job(&config, 3);
    assert_eq!(
        server.run_job_synchronous(direct.clone()).unwrap(),
        JobState::ResultsReady
    );
    assert_eq!(dispatcher.counters(), JobCounters::default());
    assert_eq!(dispatcher.num_uncompleted_jobs().unwrap(), 0);
    assert!(dispatcher
        .wait_all_jobs_completed(Some(Duration::from_secs(1)))
        .unwrap());

    // the server went back to the dispatcher and still takes its jobs
    let sent = square_job(&config, 4);
    dispatcher.send_job(sent.clone()).unwrap();
    assert!(dispatcher
        .wait_all_jobs_completed(Some(Duration::from_secs(5)))
        .unwrap());
    assert_eq!(sent.result(), Some(16));
    let counters = dispatcher.counters();
    assert_eq!((counters.sent, counters.started, counters.finished), (1, 1, 1));
    assert_eq!(server.jobs_run(), 2);
}

#[test]
fn test_removed_server_still_reports_its_running_job() {
    let config = quiet_config();
    let dispatcher = JobDispatcher::with_servers(&config, 1, ServerMode::Serving).unwrap();
    let server = dispatcher.servers()[0].clone();
    let job = sleeping_job(&config, 100);
    dispatcher.send_job(job.clone()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while job.state() != JobState::Executing && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    dispatcher.remove_server(&server).unwrap();
    assert!(dispatcher
        .wait_all_jobs_completed(Some(Duration::from_secs(5)))
        .unwrap());
    assert_eq!(dispatcher.num_finished_jobs(), 1);
    assert_eq!(dispatcher.num_idle_servers(), 0);
    assert!(server.wait_job_released(job.id(), Some(Duration::from_secs(5))));
    assert!(server.is_idle());
}
