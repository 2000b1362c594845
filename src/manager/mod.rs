//! The `ProcessManager` interface (§4.1-§4.4) and the two concrete strategies that implement it.

pub mod cold_spawn;
pub mod fork;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crossbeam::channel::Receiver;

use crate::errors::ProcessManagerError;
use crate::process_info::ProcessInfo;
use crate::queues::WorkOutcome;

/// Per-worker end grace period: `end_process` waits this long for a voluntary exit before forcing
/// termination (§4.3, §5).
pub const PROCESS_END_GRACE: Duration = Duration::from_secs(10);

/// Bound on waiting for a forced termination to actually take effect.
pub const PROCESS_TERMINATED_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the supervisor main loop polls the ControlQueue and reaps children (§4.4 step 5).
pub const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls `is_alive` every 50ms until it reports the process gone, surfacing
/// `ProcessManagerError::ProcessTerminatedTimeout` if `timeout` elapses first. Called after a
/// forced kill to confirm the OS actually reaped the process, mirroring the polling loop the
/// original implementation runs over `psutil.pid_exists` for the same purpose.
pub fn ensure_process_terminated_within_timeout(
    timeout: Duration,
    mut is_alive: impl FnMut() -> Result<bool, ProcessManagerError>,
) -> Result<(), ProcessManagerError> {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ProcessManagerError::ProcessTerminatedTimeout {
                timeout_secs: timeout.as_secs(),
            });
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// A command pushed onto the ControlQueue, paired with the target worker index (§3: ControlQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessControlSignal {
    Start,
    Restart,
    End,
}

/// Common lifecycle operations both process-creation strategies expose to the coordinator (§2,
/// component 3). `restart_process` has a uniform default of end-then-new; both concrete managers
/// use it as-is.
pub trait ProcessManager {
    fn start_processes(&self) -> Result<(), ProcessManagerError>;

    fn new_process(&self, index: usize) -> Result<(), ProcessManagerError>;

    fn end_process(&self, index: usize) -> Result<(), ProcessManagerError>;

    fn restart_process(&self, index: usize) -> Result<(), ProcessManagerError> {
        self.end_process(index)?;
        self.new_process(index)
    }

    /// Checks whatever external condition this strategy relies on for supervision (a no-op for
    /// cold-spawn, the supervisor's OS process state for fork mode).
    fn ensure_healthy(&self) -> Result<(), ProcessManagerError>;

    fn get_process_info(&self, index: usize) -> Result<ProcessInfo, ProcessManagerError>;
}

/// The per-worker request/result plumbing both concrete managers expose alongside
/// `ProcessManager`, split into its own trait since it is generic over the wire types rather than
/// the manager's lifecycle operations.
pub trait PoolQueues<Req, Res> {
    fn send_request(
        &self,
        index: usize,
        correlation_id: u64,
        payload: Req,
    ) -> Result<(), ProcessManagerError>;

    fn output_receiver(&self, index: usize) -> Option<Receiver<WorkOutcome<Res>>>;
}
