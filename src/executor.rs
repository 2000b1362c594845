//! External collaborator interfaces (§6). The flow DSL, its interpreter, and the run-storage
//! backend are out of scope for this crate; these traits are the seam a flow-execution engine
//! plugs into.

use serde::{de::DeserializeOwned, Serialize};

use crate::errors::SerializedWorkerError;

/// Persistence backend for execution bookkeeping. Out of scope beyond being a constructor
/// argument to `ExecutorFactory::create` — the pool never calls its methods directly.
pub trait RunStorage: Send + 'static {}

impl RunStorage for () {}

/// A request/result pair that can cross the process boundary. Implemented for any type that is
/// `Serialize + DeserializeOwned`; the pool treats the payload as opaque.
pub trait Wire: Serialize + DeserializeOwned + Send + 'static {}
impl<T: Serialize + DeserializeOwned + Send + 'static> Wire for T {}

/// One user-defined flow, constructed fresh inside each worker process.
pub trait Executor: Send {
    type Request: Wire;
    type Response: Wire;

    /// Executes a single request. Any error is caught by `WorkerTarget` and serialized as a
    /// `SerializedWorkerError` — it must never unwind out of the worker loop.
    fn execute(&mut self, request: Self::Request) -> Result<Self::Response, SerializedWorkerError>;
}

/// Builds an `Executor` from a run-storage handle. Must be cheap to clone/reconstruct so a
/// cold-spawned process (which starts from nothing) and a forked process (which inherits the
/// loaded flow, see `manager::fork`) can both use it.
pub trait ExecutorFactory: Send + Sync + 'static {
    type Storage: RunStorage;
    type Exec: Executor;

    fn create(&self, storage: Self::Storage) -> Self::Exec;
}
