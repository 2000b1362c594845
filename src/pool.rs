//! `PoolContext` (§3): ties a concrete `ProcessManager` to the ambient state every worker needs
//! replayed into it — a log-context initializer and an operation-context snapshot.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::Receiver;

use crate::context::OperationContextSnapshot;
use crate::errors::ProcessManagerError;
use crate::executor::Wire;
use crate::logging::LogContextInitializer;
use crate::manager::{PoolQueues, ProcessManager};
use crate::process_info::ProcessInfo;
use crate::queues::WorkOutcome;

/// Wraps a `ProcessManager` (either `ColdSpawnManager` or `PreloadedForkManager`) with the
/// request-correlation bookkeeping and ambient state the coordinator needs, independent of which
/// process-creation strategy is in play.
pub struct PoolContext<M, Req, Res> {
    manager: M,
    log_context_init: Option<LogContextInitializer>,
    operation_context: OperationContextSnapshot,
    next_correlation_id: AtomicU64,
    _marker: PhantomData<(Req, Res)>,
}

impl<M, Req, Res> PoolContext<M, Req, Res>
where
    M: ProcessManager + PoolQueues<Req, Res>,
    Req: Wire,
    Res: Wire,
{
    pub fn new(
        manager: M,
        log_context_init: Option<LogContextInitializer>,
        operation_context: OperationContextSnapshot,
    ) -> Self {
        Self {
            manager,
            log_context_init,
            operation_context,
            next_correlation_id: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub fn log_context_init(&self) -> Option<LogContextInitializer> {
        self.log_context_init.clone()
    }

    pub fn operation_context(&self) -> OperationContextSnapshot {
        self.operation_context.clone()
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn start(&self) -> Result<(), ProcessManagerError> {
        self.manager.start_processes()
    }

    /// Enqueues `payload` on worker `index`'s input queue and returns the correlation id the
    /// result will be tagged with.
    pub fn submit(&self, index: usize, payload: Req) -> Result<u64, ProcessManagerError> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        self.manager.send_request(index, correlation_id, payload)?;
        Ok(correlation_id)
    }

    pub fn results(&self, index: usize) -> Option<Receiver<WorkOutcome<Res>>> {
        self.manager.output_receiver(index)
    }

    pub fn process_info(&self, index: usize) -> Result<ProcessInfo, ProcessManagerError> {
        self.manager.get_process_info(index)
    }

    pub fn restart(&self, index: usize) -> Result<(), ProcessManagerError> {
        self.manager.restart_process(index)
    }

    pub fn end(&self, index: usize) -> Result<(), ProcessManagerError> {
        self.manager.end_process(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::cold_spawn::ColdSpawnManager;

    #[test]
    fn submit_assigns_increasing_correlation_ids() {
        let manager: ColdSpawnManager<i32, i32> =
            ColdSpawnManager::with_program(1, "/bin/sh", vec!["-c".into(), "sleep 5".into()]);
        manager.start_processes().unwrap();
        let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());

        // The spawned /bin/sh doesn't speak our wire protocol, so `submit` succeeds (the pipe
        // write goes through) even though nothing will ever read it back.
        let first = pool.submit(0, 1).unwrap();
        let second = pool.submit(0, 2).unwrap();
        assert_eq!(second, first + 1);

        pool.end(0).unwrap();
    }

    #[test]
    fn submit_to_an_unstarted_worker_fails_cleanly() {
        let manager: ColdSpawnManager<i32, i32> =
            ColdSpawnManager::with_program(1, "/bin/sh", vec!["-c".into(), "sleep 1".into()]);
        let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());
        assert!(pool.submit(0, 1).is_err());
    }
}
