//! Operation-context propagation across the process boundary.
//!
//! The coordinator captures a flat `string -> string` map of telemetry tags at pool-creation
//! time and serializes it into every spawned or forked child. There is no other shared global
//! state: log-context is reinitialized separately via `LogContextInitializer` (see `logging.rs`).

use std::cell::RefCell;
use std::collections::BTreeMap;

thread_local! {
    static OPERATION_CONTEXT: RefCell<BTreeMap<String, String>> = const { RefCell::new(BTreeMap::new()) };
}

/// A snapshot of operation-context tags, captured once by the coordinator and re-injected into
/// every subprocess before any user code runs. Plain data, so it serializes for free.
pub type OperationContextSnapshot = BTreeMap<String, String>;

/// Captures the current thread's operation context.
pub fn snapshot() -> OperationContextSnapshot {
    OPERATION_CONTEXT.with(|ctx| ctx.borrow().clone())
}

/// Restores a previously captured snapshot into this thread's operation context. Must be called
/// before constructing the executor in a spawned/forked child — thread-locals do not propagate
/// across `fork(2)` or `exec(3)` by themselves.
pub fn restore(snapshot: OperationContextSnapshot) {
    OPERATION_CONTEXT.with(|ctx| *ctx.borrow_mut() = snapshot);
}

/// Reads a single tag from the current thread's operation context, if present.
pub fn get(key: &str) -> Option<String> {
    OPERATION_CONTEXT.with(|ctx| ctx.borrow().get(key).cloned())
}

/// Sets a single tag on the current thread's operation context.
pub fn set(key: impl Into<String>, value: impl Into<String>) {
    OPERATION_CONTEXT.with(|ctx| {
        ctx.borrow_mut().insert(key.into(), value.into());
    });
}
