//! End-to-end scenarios for the worker pool, exercised against the compiled `flow-pool-demo`
//! binary rather than an in-process stand-in, so both process-creation strategies go through a
//! real `fork`/`exec` and real pipes.

use std::time::Duration;

use flow_worker_pool::context::OperationContextSnapshot;
use flow_worker_pool::errors::ProcessManagerError;
use flow_worker_pool::manager::cold_spawn::ColdSpawnManager;
use flow_worker_pool::manager::fork::PreloadedForkManager;
use flow_worker_pool::manager::{PoolQueues, ProcessManager};
use flow_worker_pool::pool::PoolContext;
use flow_worker_pool::queues::WorkOutcome;

fn demo_bin() -> std::path::PathBuf {
    assert_cmd::cargo::cargo_bin("flow-pool-demo")
}

fn expect_square(pool: &PoolContext<impl ProcessManager + PoolQueues<i64, i64>, i64, i64>, index: usize, input: i64) {
    pool.submit(index, input).unwrap();
    let outcome = pool
        .results(index)
        .unwrap()
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    match outcome {
        WorkOutcome::Success { payload, .. } => assert_eq!(payload, input * input),
        WorkOutcome::Failure { error, .. } => panic!("unexpected failure: {error}"),
    }
}

#[test]
fn cold_spawn_pool_executes_requests_and_reports_user_errors() {
    let manager: ColdSpawnManager<i64, i64> =
        ColdSpawnManager::with_program(1, demo_bin(), Vec::new());
    let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());
    pool.start().unwrap();

    expect_square(&pool, 0, 6);

    pool.submit(0, -1).unwrap();
    match pool.results(0).unwrap().recv_timeout(Duration::from_secs(5)).unwrap() {
        WorkOutcome::Failure { error, .. } => assert_eq!(error.code, "UserError"),
        WorkOutcome::Success { .. } => panic!("expected a UserError"),
    }

    pool.end(0).unwrap();
}

#[test]
fn fork_pool_executes_requests_and_reports_user_errors() {
    let manager: PreloadedForkManager<i64, i64> =
        PreloadedForkManager::with_program(1, demo_bin(), Vec::new());
    let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());
    pool.start().unwrap();

    expect_square(&pool, 0, 7);

    pool.submit(0, -1).unwrap();
    match pool.results(0).unwrap().recv_timeout(Duration::from_secs(5)).unwrap() {
        WorkOutcome::Failure { error, .. } => assert_eq!(error.code, "UserError"),
        WorkOutcome::Success { .. } => panic!("expected a UserError"),
    }

    pool.end(0).unwrap();
}

#[test]
fn cold_spawn_restart_replaces_a_crashed_worker_with_a_working_one() {
    let manager: ColdSpawnManager<i64, i64> =
        ColdSpawnManager::with_program(1, demo_bin(), Vec::new());
    let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());
    pool.start().unwrap();

    let original_pid = pool.process_info(0).unwrap().pid;

    // i64::MIN is the crash sentinel: the worker calls process::exit(1) without ever writing a
    // response, so its output queue just goes silent.
    pool.submit(0, i64::MIN).unwrap();
    std::thread::sleep(Duration::from_millis(500));

    pool.restart(0).unwrap();
    let restarted_pid = pool.process_info(0).unwrap().pid;
    assert_ne!(original_pid, restarted_pid);

    expect_square(&pool, 0, 8);

    pool.end(0).unwrap();
}

#[test]
fn fork_restart_replaces_a_crashed_worker_with_a_working_one() {
    let manager: PreloadedForkManager<i64, i64> =
        PreloadedForkManager::with_program(1, demo_bin(), Vec::new());
    let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());
    pool.start().unwrap();

    let original_pid = pool.process_info(0).unwrap().pid;

    pool.submit(0, i64::MIN).unwrap();
    std::thread::sleep(Duration::from_millis(500));

    pool.restart(0).unwrap();

    // The fork supervisor's reaping loop polls once a second; give it a little longer than one
    // tick to notice the crash, publish the restart, and register the new pid.
    let mut restarted_pid = pool.process_info(0).unwrap().pid;
    for _ in 0..10 {
        if restarted_pid != original_pid {
            break;
        }
        std::thread::sleep(Duration::from_millis(300));
        restarted_pid = pool.process_info(0).unwrap().pid;
    }
    assert_ne!(original_pid, restarted_pid);

    expect_square(&pool, 0, 9);

    pool.end(0).unwrap();
}

#[test]
fn fork_manager_reports_start_failure_instead_of_hanging_when_the_supervisor_dies_immediately() {
    // Stand in for the supervisor with a program that exits before ever forking a worker or
    // writing to the status pipe, so `get_process_info` must detect the death rather than wait
    // out the full timeout.
    let manager: PreloadedForkManager<i64, i64> =
        PreloadedForkManager::with_program(1, "/bin/false", Vec::new());
    let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());
    pool.start().unwrap();

    let started = std::time::Instant::now();
    let err = pool.process_info(0).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        err,
        ProcessManagerError::SpawnedForkProcessManagerStartFailure
    ));
}
