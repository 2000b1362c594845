//! The ProcessInfo registry (§3, §4.1 of the spec).
//!
//! A keyed mapping from worker index to `{pid, name}` that must be readable from both the
//! coordinator and, in fork mode, the supervisor. Rather than true shared memory we follow the
//! design note's preferred alternative: the supervisor publishes updates over a dedicated status
//! channel which a coordinator-side thread mirrors into this registry (see
//! `manager::fork::PreloadedForkManager`). In cold-spawn mode the coordinator is the only writer
//! and mirroring is unnecessary.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::ProcessManagerError;

pub const PROCESS_INFO_OBTAINED_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub index: usize,
    pub pid: u32,
    pub name: String,
}

/// Cross-process-visible registry mirrored from whichever component is spawning OS processes
/// for this pool. Writes are single-writer (coordinator in cold-spawn mode, the supervisor's
/// mirroring thread in fork mode); reads happen from any coordinator thread asking
/// `get_process_info`.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<(Mutex<HashMap<usize, ProcessInfo>>, Condvar)>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ProcessInfo) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().insert(info.index, info);
        cvar.notify_all();
    }

    pub fn remove(&self, index: usize) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().remove(&index);
        cvar.notify_all();
    }

    pub fn get(&self, index: usize) -> Option<ProcessInfo> {
        self.inner.0.lock().unwrap().get(&index).cloned()
    }

    /// Blocks until `index` appears in the registry, `timeout` elapses, or `ensure_healthy`
    /// reports a failure. `ensure_healthy` is polled on every wake-up rather than only once, so a
    /// supervisor dying mid-wait is detected promptly instead of via a full timeout.
    pub fn get_process_info(
        &self,
        index: usize,
        timeout: Duration,
        mut ensure_healthy: impl FnMut() -> Result<(), ProcessManagerError>,
    ) -> Result<ProcessInfo, ProcessManagerError> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut guard = lock.lock().unwrap();
        loop {
            ensure_healthy()?;
            if let Some(info) = guard.get(&index) {
                return Ok(info.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProcessManagerError::ProcessInfoObtainedTimeout {
                    index,
                    timeout_secs: timeout.as_secs(),
                });
            }
            // Wake up at least once a second so `ensure_healthy` keeps being polled even if
            // nobody ever inserts the entry we're waiting for.
            let wait_for = remaining.min(Duration::from_secs(1));
            let (next_guard, _) = cvar.wait_timeout(guard, wait_for).unwrap();
            guard = next_guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn returns_entry_once_inserted_from_another_thread() {
        let registry = ProcessRegistry::new();
        let registry_clone = registry.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            registry_clone.insert(ProcessInfo {
                index: 0,
                pid: 1234,
                name: "worker-0".to_string(),
            });
        });

        let info = registry
            .get_process_info(0, Duration::from_secs(5), || Ok(()))
            .unwrap();
        assert_eq!(info.pid, 1234);
    }

    #[test]
    fn times_out_when_entry_never_appears() {
        let registry = ProcessRegistry::new();
        let err = registry
            .get_process_info(0, Duration::from_millis(100), || Ok(()))
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessManagerError::ProcessInfoObtainedTimeout { index: 0, .. }
        ));
    }

    #[test]
    fn health_check_failure_preempts_the_timeout() {
        let registry = ProcessRegistry::new();
        let err = registry
            .get_process_info(0, Duration::from_secs(60), || {
                Err(ProcessManagerError::SpawnedForkProcessManagerStartFailure)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessManagerError::SpawnedForkProcessManagerStartFailure
        ));
    }
}
