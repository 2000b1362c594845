//! `SingleShotInvoker` (§4.5): an unrelated primitive used by the admission layer to run one
//! function in its own subprocess with a wall-clock timeout, independent of the worker pool.

use std::ffi::OsString;
use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::context::{self, OperationContextSnapshot};
use crate::errors::{SerializedWorkerError, SingleShotError};
use crate::executor::Wire;
use crate::logging::LogContextInitializer;
use crate::queues::make_pipe;
use crate::spawn::{self};
use crate::wire::{recv_frame, send_frame};

pub const SINGLE_SHOT_ENV_VAR: &str = "FLOW_WORKER_POOL_SINGLE_SHOT";
const ARG_FD: RawFd = 3;
const RESULT_FD: RawFd = 4;

/// The function a `SingleShotInvoker` runs in its one-off subprocess.
pub trait SingleShotTarget: Send + Sync + 'static {
    type Arg: Wire;
    type Output: Wire;

    fn call(&self, arg: Self::Arg) -> Result<Self::Output, SerializedWorkerError>;
}

#[derive(Debug, Serialize, Deserialize)]
enum SingleShotOutcome<Output> {
    Success(Output),
    Failure(SerializedWorkerError),
}

/// Child-side entry point. A consumer's `main()` calls this (after `dispatch_role` returns
/// `false`) so a re-exec'd single-shot child can find its way back into `target.call`.
pub fn dispatch_single_shot_role<T: SingleShotTarget>(target: &T) -> bool {
    if std::env::var(SINGLE_SHOT_ENV_VAR).is_err() {
        return false;
    }

    let mut arg_file = unsafe { std::fs::File::from_raw_fd(ARG_FD) };
    let mut result_file = unsafe { std::fs::File::from_raw_fd(RESULT_FD) };

    let (operation_context, arg): (OperationContextSnapshot, T::Arg) =
        recv_frame(&mut arg_file).ok().flatten().expect("single-shot arg frame");
    context::restore(operation_context);

    let outcome = match target.call(arg) {
        Ok(output) => SingleShotOutcome::Success(output),
        Err(error) => SingleShotOutcome::Failure(error),
    };
    send_frame(&mut result_file, &outcome).expect("single-shot result frame");
    std::process::exit(0);
}

pub struct SingleShotInvoker {
    program: PathBuf,
    extra_args: Vec<OsString>,
}

impl SingleShotInvoker {
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_program(std::env::current_exe()?, Vec::new()))
    }

    pub fn with_program(program: impl Into<PathBuf>, extra_args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            extra_args,
        }
    }

    /// Runs `target.call(arg)` in a freshly spawned subprocess, bounded by `timeout` (unbounded
    /// if `None`). `name` is used only for logging (§4.5: log at info on started/completed, error
    /// on timeout, nothing extra on a structured failure).
    pub async fn invoke<T: SingleShotTarget>(
        &self,
        name: &str,
        arg: T::Arg,
        operation_context: OperationContextSnapshot,
        log_context_init: Option<LogContextInitializer>,
        timeout: Option<Duration>,
    ) -> Result<T::Output, SingleShotError> {
        let _ = &log_context_init; // replayed in the child via dispatch_single_shot_role, not here

        info!(name, msg = "started");

        let (arg_read, arg_write) = make_pipe()?;
        let (result_read, result_write) = make_pipe()?;
        let mut arg_write = unsafe { std::fs::File::from_raw_fd(arg_write.into_raw_fd()) };

        let mut command = Command::new(&self.program);
        command
            .args(&self.extra_args)
            .env(SINGLE_SHOT_ENV_VAR, "1");

        let arg_read_fd: RawFd = arg_read.into_raw_fd();
        let result_write_fd: RawFd = result_write.into_raw_fd();
        unsafe {
            spawn::pass_fds(
                &mut command,
                vec![(arg_read_fd, ARG_FD), (result_write_fd, RESULT_FD)],
            );
        }

        let child = command.spawn()?;

        unsafe {
            let _ = std::fs::File::from_raw_fd(arg_read_fd);
            let _ = std::fs::File::from_raw_fd(result_write_fd);
        }

        send_frame(&mut arg_write, &(operation_context, arg))?;
        drop(arg_write);

        let mut result_read = unsafe { std::fs::File::from_raw_fd(result_read.into_raw_fd()) };
        let child = Arc::new(Mutex::new(child));
        let waiter_child = child.clone();

        let join = tokio::task::spawn_blocking(move || -> Result<SingleShotOutcome<T::Output>, SingleShotError> {
            let outcome = recv_frame::<_, SingleShotOutcome<T::Output>>(&mut result_read)?;
            let status = waiter_child.lock().unwrap().wait()?;
            match outcome {
                Some(outcome) => Ok(outcome),
                None if status.success() => Err(SingleShotError::UnexpectedError),
                None => Err(SingleShotError::UnexpectedError),
            }
        });

        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, join).await {
                Ok(joined) => joined.map_err(|_| SingleShotError::UnexpectedError)?,
                Err(_elapsed) => {
                    error!(name, timeout_secs = timeout.as_secs(), msg = "execution timed out");
                    let _ = child.lock().unwrap().kill();
                    return Err(SingleShotError::ExecutionTimeoutError(timeout.as_secs()));
                }
            },
            None => join.await.map_err(|_| SingleShotError::UnexpectedError)?,
        };

        match outcome {
            Ok(SingleShotOutcome::Success(value)) => {
                info!(name, msg = "completed");
                Ok(value)
            }
            Ok(SingleShotOutcome::Failure(error)) => Err(SingleShotError::Remote(error)),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_round_trips_through_a_pipe() {
        let mut buf = Vec::new();
        send_frame(&mut buf, &SingleShotOutcome::Success(42i32)).unwrap();
        let mut cursor = io::Cursor::new(buf);
        let decoded: SingleShotOutcome<i32> = recv_frame(&mut cursor).unwrap().unwrap();
        assert!(matches!(decoded, SingleShotOutcome::Success(42)));
    }

    #[test]
    fn failure_outcome_round_trips_through_a_pipe() {
        let mut buf = Vec::new();
        let error = SerializedWorkerError::new("UserError", "bad input");
        send_frame(&mut buf, &SingleShotOutcome::<i32>::Failure(error.clone())).unwrap();
        let mut cursor = io::Cursor::new(buf);
        let decoded: SingleShotOutcome<i32> = recv_frame(&mut cursor).unwrap().unwrap();
        match decoded {
            SingleShotOutcome::Failure(decoded_error) => assert_eq!(decoded_error, error),
            SingleShotOutcome::Success(_) => panic!("expected Failure"),
        }
    }
}
