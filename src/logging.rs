//! Log-context replay across the process boundary.
//!
//! A `LogContextInitializer` is a zero-argument, side-effectful closure the coordinator hands to
//! every spawned or forked child; it is invoked once, before the child constructs its executor,
//! so per-process log sinks (files, spans with the worker index baked in) are established the
//! same way whether the process was cold-spawned or forked. Kept as a boxed `Fn` rather than a
//! generic so it can be threaded through `PoolContext` without infecting every signature with a
//! type parameter, the same tradeoff the teacher's `LogContext` initializer makes.

use std::sync::Arc;

pub type LogContextInitializer = Arc<dyn Fn() + Send + Sync>;

/// Initializes a `tracing` subscriber reading its filter from `RUST_LOG`, falling back to
/// `info`. Suitable as the default `LogContextInitializer` for a worker process; consumers that
/// need file-per-worker logging (as the teacher does for on-host supervisors) provide their own
/// closure instead.
pub fn init_default_subscriber() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn initializer_closure_runs_exactly_once_when_invoked() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let init: LogContextInitializer = Arc::new(move || ran_clone.store(true, Ordering::SeqCst));

        init();
        assert!(ran.load(Ordering::SeqCst));
    }
}
