//! A worker-process pool that executes user-defined flows in isolated OS processes (§1).
//!
//! Two process-creation strategies are available: [`manager::cold_spawn::ColdSpawnManager`]
//! re-execs a clean process per worker; [`manager::fork::PreloadedForkManager`] loads the flow
//! once in a supervisor and forks workers that inherit it via copy-on-write. Both implement
//! [`manager::ProcessManager`]. [`single_shot::SingleShotInvoker`] is a separate primitive for
//! running one admission-time function in a timeboxed subprocess.
//!
//! Every consumer binary must call [`dispatch_role`] as the first statement in `main` (§2.1): on
//! an ordinary invocation it returns immediately; in a re-exec'd worker or supervisor it runs the
//! corresponding loop against inherited file descriptors and never returns.

pub mod context;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod pool;
pub mod process_info;
pub mod queues;
pub mod single_shot;
pub mod spawn;
pub mod wire;
pub mod worker;

use context::OperationContextSnapshot;
use executor::ExecutorFactory;
use logging::LogContextInitializer;
use queues::{InputQueueReader, OutputQueueWriter};
use spawn::Role;

/// Decodes this process's role from the environment and, if it was re-exec'd as a worker or
/// supervisor, runs the corresponding loop and never returns. Returns `false` on an ordinary
/// coordinator invocation, meaning the caller should proceed with its own `main` logic.
pub fn dispatch_role<F>(
    factory: &F,
    storage_factory: impl Fn() -> F::Storage,
    log_context_init: Option<LogContextInitializer>,
    operation_context: OperationContextSnapshot,
) -> bool
where
    F: ExecutorFactory,
{
    match Role::from_env() {
        None => false,
        Some(Role::Worker { index }) => {
            let input = unsafe { InputQueueReader::from_raw_fd(spawn::WORKER_INPUT_FD) };
            let output = unsafe { OutputQueueWriter::from_raw_fd(spawn::WORKER_OUTPUT_FD) };
            worker::run(
                format!("worker-{index}"),
                factory,
                storage_factory(),
                input,
                output,
                log_context_init,
                operation_context,
            );
            std::process::exit(0);
        }
        Some(Role::Supervisor { worker_count }) => {
            manager::fork::run_supervisor_loop(
                factory,
                storage_factory,
                worker_count,
                log_context_init,
                operation_context,
            );
            std::process::exit(0);
        }
    }
}
