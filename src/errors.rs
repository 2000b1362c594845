use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where an error originated, mirrored on the wire so a caller can tell a pool-management
/// failure apart from a failure raised by user flow code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTarget {
    Executor,
    ProcessManager,
}

impl fmt::Display for ErrorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorTarget::Executor => write!(f, "EXECUTOR"),
            ErrorTarget::ProcessManager => write!(f, "PROCESS_MANAGER"),
        }
    }
}

/// A structured exception raised by user flow code (or by the single-shot target function),
/// serialized across the process boundary so the coordinator can re-raise it with the original
/// code and message preserved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedWorkerError {
    pub code: String,
    pub message: String,
    pub inner: Option<String>,
    pub parameters: std::collections::BTreeMap<String, String>,
}

impl SerializedWorkerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            inner: None,
            parameters: Default::default(),
        }
    }

    pub fn with_inner(mut self, inner: impl Into<String>) -> Self {
        self.inner = Some(inner.into());
        self
    }

    /// `true` for the well-known user-facing codes the external HTTP/RPC layer maps to 404
    /// responses; everything else maps to a 500. The pool only tags the payload, it never
    /// performs the mapping itself.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self.code.as_str(),
            "UserError" | "ConnectionNotFoundError" | "RunNotFoundError"
        )
    }
}

impl fmt::Display for SerializedWorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SerializedWorkerError {}

/// Errors raised by the `ProcessManager` family (§7 of the spec).
#[derive(Error, Debug)]
pub enum ProcessManagerError {
    #[error("process info for worker {index} was not obtained within {timeout_secs} seconds")]
    ProcessInfoObtainedTimeout { index: usize, timeout_secs: u64 },

    #[error("process did not terminate within {timeout_secs} seconds")]
    ProcessTerminatedTimeout { timeout_secs: u64 },

    #[error("the spawned fork process manager failed to start")]
    SpawnedForkProcessManagerStartFailure,

    #[error("no worker is registered at index {index}")]
    WorkerNotFound { index: usize },

    #[error("the process pool has not been started yet")]
    PoolNotStarted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by `SingleShotInvoker` (§4.5, §7 of the spec).
#[derive(Error, Debug)]
pub enum SingleShotError {
    #[error("Execution timeout for exceeding {0} seconds")]
    ExecutionTimeoutError(u64),

    #[error("Unexpected error occurred while executing the request")]
    UnexpectedError,

    #[error("{0}")]
    Remote(#[from] SerializedWorkerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SingleShotError {
    pub fn target(&self) -> ErrorTarget {
        ErrorTarget::Executor
    }
}
