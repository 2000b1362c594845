//! `ColdSpawnManager` (§4.3): each worker is a freshly re-exec'd process with a clean address
//! space and no inherited file descriptors beyond its own queue endpoints.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use tracing::{info, warn};

use crate::errors::ProcessManagerError;
use crate::executor::Wire;
use crate::process_info::{ProcessInfo, ProcessRegistry, PROCESS_INFO_OBTAINED_TIMEOUT};
use crate::queues::{make_pipe, InputQueueWriter, OutputQueueReader, WorkOutcome};
use crate::spawn::{self, Role};

use super::{PoolQueues, ProcessManager, PROCESS_END_GRACE};

struct WorkerHandle<Req, Res> {
    child: Child,
    input: InputQueueWriter<Req>,
    output: OutputQueueReader<Res>,
}

/// Spawns each worker as the current binary re-exec'd with a role marker (§2.1), so it must be
/// paired with a consumer `main()` that calls `dispatch_role` before doing anything else.
pub struct ColdSpawnManager<Req, Res> {
    program: PathBuf,
    extra_args: Vec<OsString>,
    worker_count: usize,
    registry: ProcessRegistry,
    handles: Mutex<HashMap<usize, WorkerHandle<Req, Res>>>,
}

impl<Req, Res> ColdSpawnManager<Req, Res>
where
    Req: Wire,
    Res: Wire,
{
    pub fn new(worker_count: usize) -> io::Result<Self> {
        Ok(Self::with_program(
            worker_count,
            std::env::current_exe()?,
            Vec::new(),
        ))
    }

    /// Overrides the program/args used to spawn a worker. Primarily useful for tests, which can't
    /// re-exec the `cargo test` harness binary as a worker.
    pub fn with_program(
        worker_count: usize,
        program: impl Into<PathBuf>,
        extra_args: Vec<OsString>,
    ) -> Self {
        Self {
            program: program.into(),
            extra_args,
            worker_count,
            registry: ProcessRegistry::new(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> ProcessRegistry {
        self.registry.clone()
    }

    pub fn send_request(
        &self,
        index: usize,
        correlation_id: u64,
        payload: Req,
    ) -> Result<(), ProcessManagerError> {
        let mut handles = self.handles.lock().unwrap();
        let handle = handles
            .get_mut(&index)
            .ok_or(ProcessManagerError::WorkerNotFound { index })?;
        handle.input.send_request(correlation_id, payload)?;
        Ok(())
    }

    pub fn send_terminate(&self, index: usize) -> Result<(), ProcessManagerError> {
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.get_mut(&index) {
            handle.input.send_terminate()?;
        }
        Ok(())
    }

    pub fn output_receiver(&self, index: usize) -> Option<Receiver<WorkOutcome<Res>>> {
        let handles = self.handles.lock().unwrap();
        handles.get(&index).map(|h| h.output.receiver().clone())
    }
}

impl<Req, Res> PoolQueues<Req, Res> for ColdSpawnManager<Req, Res>
where
    Req: Wire,
    Res: Wire,
{
    fn send_request(
        &self,
        index: usize,
        correlation_id: u64,
        payload: Req,
    ) -> Result<(), ProcessManagerError> {
        ColdSpawnManager::send_request(self, index, correlation_id, payload)
    }

    fn output_receiver(&self, index: usize) -> Option<Receiver<WorkOutcome<Res>>> {
        ColdSpawnManager::output_receiver(self, index)
    }
}

impl<Req, Res> ProcessManager for ColdSpawnManager<Req, Res>
where
    Req: Wire,
    Res: Wire,
{
    fn start_processes(&self) -> Result<(), ProcessManagerError> {
        for i in 0..self.worker_count {
            self.new_process(i)?;
        }
        Ok(())
    }

    fn new_process(&self, index: usize) -> Result<(), ProcessManagerError> {
        let (in_read, in_write) = make_pipe()?;
        let (out_read, out_write) = make_pipe()?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.extra_args)
            .env(spawn::ROLE_ENV_VAR, Role::Worker { index }.env_value());

        let in_read_fd: RawFd = in_read.into_raw_fd();
        let out_write_fd: RawFd = out_write.into_raw_fd();
        unsafe {
            spawn::pass_fds(
                &mut command,
                vec![
                    (in_read_fd, spawn::WORKER_INPUT_FD),
                    (out_write_fd, spawn::WORKER_OUTPUT_FD),
                ],
            );
        }

        let child = command.spawn()?;
        let pid = child.id();

        // The child now owns these through its inherited copies; close our originals.
        unsafe {
            let _ = std::fs::File::from_raw_fd(in_read_fd);
            let _ = std::fs::File::from_raw_fd(out_write_fd);
        }

        let input = unsafe { InputQueueWriter::from_raw_fd(in_write.into_raw_fd()) };
        let output = unsafe { OutputQueueReader::from_raw_fd(out_read.into_raw_fd()) };

        self.registry.insert(ProcessInfo {
            index,
            pid,
            name: format!("worker-{index}"),
        });

        self.handles.lock().unwrap().insert(
            index,
            WorkerHandle {
                child,
                input,
                output,
            },
        );
        info!(index, pid, msg = "cold-spawned worker");
        Ok(())
    }

    fn end_process(&self, index: usize) -> Result<(), ProcessManagerError> {
        let mut handle = self.handles.lock().unwrap().remove(&index);
        self.registry.remove(index);

        let Some(handle) = handle.as_mut() else {
            warn!(index, msg = "end_process called with no running worker, continuing");
            return Ok(());
        };

        let _ = handle.input.send_terminate();

        let deadline = Instant::now() + PROCESS_END_GRACE;
        loop {
            match handle.child.try_wait()? {
                Some(_status) => return Ok(()),
                None if Instant::now() >= deadline => break,
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }

        warn!(index, msg = "worker did not exit voluntarily, terminating");
        handle.child.kill()?;
        super::ensure_process_terminated_within_timeout(super::PROCESS_TERMINATED_TIMEOUT, || {
            Ok(handle.child.try_wait()?.is_none())
        })
    }

    fn ensure_healthy(&self) -> Result<(), ProcessManagerError> {
        Ok(())
    }

    fn get_process_info(&self, index: usize) -> Result<ProcessInfo, ProcessManagerError> {
        self.registry
            .get_process_info(index, PROCESS_INFO_OBTAINED_TIMEOUT, || Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_process_registers_process_info_with_a_real_pid() {
        let manager: ColdSpawnManager<i32, i32> =
            ColdSpawnManager::with_program(1, "/bin/sh", vec!["-c".into(), "sleep 5".into()]);

        manager.new_process(0).unwrap();
        let info = manager.get_process_info(0).unwrap();
        assert!(info.pid > 0);

        manager.end_process(0).unwrap();
        assert!(manager.registry().get(0).is_none());
    }

    #[test]
    fn end_process_on_an_already_exited_worker_is_a_clean_no_op() {
        let manager: ColdSpawnManager<i32, i32> =
            ColdSpawnManager::with_program(1, "/bin/sh", vec!["-c".into(), "exit 0".into()]);

        manager.new_process(0).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        manager.end_process(0).unwrap();
    }

    #[test]
    fn end_process_on_an_unknown_worker_is_a_no_op() {
        let manager: ColdSpawnManager<i32, i32> = ColdSpawnManager::with_program(
            1,
            "/bin/sh",
            vec!["-c".into(), "sleep 1".into()],
        );
        manager.end_process(7).unwrap();
    }
}
