//! `WorkerTarget` (§4.2): the function every worker process runs, cold-spawned or forked.

use tracing::{debug, error, info, info_span};

use crate::context::OperationContextSnapshot;
use crate::errors::SerializedWorkerError;
use crate::executor::{Executor, ExecutorFactory};
use crate::logging::LogContextInitializer;
use crate::queues::{InputQueueReader, OutputQueueWriter, WorkItem, WorkOutcome};

/// Installs a SIGINT handler that exits the process immediately. Workers hold no state that
/// needs flushing beyond what is already synchronously written per request, so an immediate exit
/// is a clean exit (§4.2 step 1). Idempotent per-process; the second call would panic inside
/// `ctrlc`, so callers should only invoke this once per worker.
pub fn install_sigint_handler(worker_name: String) {
    let _ = ctrlc::set_handler(move || {
        info!(worker = %worker_name, msg = "received SIGINT, exiting");
        std::process::exit(0);
    });
}

/// Runs one worker's cooperative request loop (§4.2). Never returns an error: every failure
/// mode inside the loop is caught, logged, and either serialized back to the coordinator or
/// simply ends the loop — errors must never escape `WorkerTarget`.
pub fn run<F>(
    name: String,
    factory: &F,
    storage: F::Storage,
    mut input: InputQueueReader<<F::Exec as Executor>::Request>,
    mut output: OutputQueueWriter<<F::Exec as Executor>::Response>,
    log_context_init: Option<LogContextInitializer>,
    operation_context: OperationContextSnapshot,
) where
    F: ExecutorFactory,
{
    install_sigint_handler(name.clone());

    if let Some(init) = log_context_init {
        init();
    }

    crate::context::restore(operation_context);

    let span = info_span!("worker", name = %name);
    let _guard = span.enter();

    let mut executor = factory.create(storage);
    info!(msg = "worker ready");

    loop {
        let item = match input.recv() {
            Ok(Some(item)) => item,
            Ok(None) => {
                debug!(msg = "input queue closed, exiting");
                break;
            }
            Err(err) => {
                error!(error = %err, msg = "failed to read from input queue, exiting");
                break;
            }
        };

        let (correlation_id, request) = match item {
            WorkItem::Terminate => {
                debug!(msg = "received terminate sentinel, exiting");
                break;
            }
            WorkItem::Run {
                correlation_id,
                payload,
            } => (correlation_id, payload),
        };

        let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            executor.execute(request)
        })) {
            Ok(Ok(response)) => WorkOutcome::Success {
                correlation_id,
                payload: response,
            },
            Ok(Err(error)) => WorkOutcome::Failure {
                correlation_id,
                error,
            },
            Err(panic) => {
                let message = panic_message(&panic);
                error!(error = %message, msg = "user flow panicked");
                WorkOutcome::Failure {
                    correlation_id,
                    error: SerializedWorkerError::new("UnexpectedError", message),
                }
            }
        };

        if let Err(err) = output.send(outcome) {
            error!(error = %err, msg = "failed to write to output queue, exiting");
            break;
        }
    }

    info!(msg = "worker loop exited");
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "user flow panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::make_pipe;
    use std::os::fd::IntoRawFd;

    struct DoublingExecutor;
    impl Executor for DoublingExecutor {
        type Request = i32;
        type Response = i32;

        fn execute(&mut self, request: i32) -> Result<i32, SerializedWorkerError> {
            if request < 0 {
                return Err(SerializedWorkerError::new("UserError", "negative input"));
            }
            if request == 13 {
                panic!("unlucky");
            }
            Ok(request * 2)
        }
    }

    struct DoublingFactory;
    impl ExecutorFactory for DoublingFactory {
        type Storage = ();
        type Exec = DoublingExecutor;
        fn create(&self, _storage: ()) -> DoublingExecutor {
            DoublingExecutor
        }
    }

    fn run_one_request(request: i32) -> WorkOutcome<i32> {
        let (in_read, in_write) = make_pipe().unwrap();
        let (out_read, out_write) = make_pipe().unwrap();

        let mut writer: crate::queues::InputQueueWriter<i32> =
            unsafe { crate::queues::InputQueueWriter::from_raw_fd(in_write.into_raw_fd()) };
        writer.send_request(1, request).unwrap();
        writer.send_terminate().unwrap();

        let input = unsafe { InputQueueReader::from_raw_fd(in_read.into_raw_fd()) };
        let output = unsafe { OutputQueueWriter::from_raw_fd(out_write.into_raw_fd()) };
        let reader: crate::queues::OutputQueueReader<i32> =
            unsafe { crate::queues::OutputQueueReader::from_raw_fd(out_read.into_raw_fd()) };

        run(
            "test-worker".to_string(),
            &DoublingFactory,
            (),
            input,
            output,
            None,
            Default::default(),
        );

        reader
            .receiver()
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn executes_successfully_and_stops_on_terminate() {
        match run_one_request(21) {
            WorkOutcome::Success {
                correlation_id,
                payload,
            } => {
                assert_eq!(correlation_id, 1);
                assert_eq!(payload, 42);
            }
            WorkOutcome::Failure { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn serializes_flow_errors_instead_of_propagating_them() {
        match run_one_request(-1) {
            WorkOutcome::Failure { error, .. } => assert_eq!(error.code, "UserError"),
            WorkOutcome::Success { .. } => panic!("expected a failure"),
        }
    }

    #[test]
    fn a_panicking_flow_is_caught_and_reported_as_a_result() {
        match run_one_request(13) {
            WorkOutcome::Failure { error, .. } => assert_eq!(error.code, "UnexpectedError"),
            WorkOutcome::Success { .. } => panic!("expected a failure"),
        }
    }
}
