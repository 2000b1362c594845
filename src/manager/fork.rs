//! `PreloadedForkManager` + the supervisor loop (§4.4): a single process loads the flow once,
//! then forks workers that inherit it via copy-on-write.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::OperationContextSnapshot;
use crate::errors::ProcessManagerError;
use crate::executor::{ExecutorFactory, Wire};
use crate::logging::LogContextInitializer;
use crate::process_info::{ProcessInfo, ProcessRegistry, PROCESS_INFO_OBTAINED_TIMEOUT};
use crate::queues::{make_pipe, InputQueueWriter, OutputQueueReader, WorkOutcome};
use crate::spawn::{self, Role};
use crate::wire::{recv_frame, send_frame};

use super::{
    ensure_process_terminated_within_timeout, PoolQueues, ProcessControlSignal, ProcessManager,
    PROCESS_END_GRACE, PROCESS_TERMINATED_TIMEOUT, SUPERVISOR_POLL_INTERVAL,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ControlMessage {
    signal: ProcessControlSignal,
    index: usize,
}

/// Published by the supervisor over the status channel so the coordinator can mirror
/// `ProcessInfo` without shared memory (§4.1 design note).
#[derive(Debug, Clone, Serialize, Deserialize)]
enum StatusEvent {
    Inserted(ProcessInfo),
    Removed(usize),
}

struct CoordinatorState<Req, Res> {
    supervisor: Child,
    control_write: std::fs::File,
    in_write: HashMap<usize, InputQueueWriter<Req>>,
    out_read: HashMap<usize, OutputQueueReader<Res>>,
}

/// Coordinator side of fork mode. Holds the pipes wired up at construction time; `start_processes`
/// actually launches the supervisor.
pub struct PreloadedForkManager<Req, Res> {
    worker_count: usize,
    program: std::path::PathBuf,
    extra_args: Vec<std::ffi::OsString>,
    registry: ProcessRegistry,
    state: Mutex<Option<CoordinatorState<Req, Res>>>,
}

impl<Req, Res> PreloadedForkManager<Req, Res>
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

    pub fn with_program(
        worker_count: usize,
        program: impl Into<std::path::PathBuf>,
        extra_args: Vec<std::ffi::OsString>,
    ) -> Self {
        Self {
            worker_count,
            program: program.into(),
            extra_args,
            registry: ProcessRegistry::new(),
            state: Mutex::new(None),
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
        let mut state = self.state.lock().unwrap();
        let state = state
            .as_mut()
            .ok_or(ProcessManagerError::PoolNotStarted)?;
        let writer = state
            .in_write
            .get_mut(&index)
            .ok_or(ProcessManagerError::WorkerNotFound { index })?;
        writer.send_request(correlation_id, payload)?;
        Ok(())
    }

    pub fn output_receiver(&self, index: usize) -> Option<Receiver<WorkOutcome<Res>>> {
        let state = self.state.lock().unwrap();
        state
            .as_ref()
            .and_then(|s| s.out_read.get(&index))
            .map(|r| r.receiver().clone())
    }

    fn send_control(&self, message: ControlMessage) -> Result<(), ProcessManagerError> {
        let mut state = self.state.lock().unwrap();
        let state = state
            .as_mut()
            .ok_or(ProcessManagerError::SpawnedForkProcessManagerStartFailure)?;
        send_frame(&mut state.control_write, &message)?;
        Ok(())
    }
}

impl<Req, Res> PoolQueues<Req, Res> for PreloadedForkManager<Req, Res>
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
        PreloadedForkManager::send_request(self, index, correlation_id, payload)
    }

    fn output_receiver(&self, index: usize) -> Option<Receiver<WorkOutcome<Res>>> {
        PreloadedForkManager::output_receiver(self, index)
    }
}

impl<Req, Res> ProcessManager for PreloadedForkManager<Req, Res>
where
    Req: Wire,
    Res: Wire,
{
    fn start_processes(&self) -> Result<(), ProcessManagerError> {
        let (control_read, control_write) = make_pipe()?;
        let (status_read, status_write) = make_pipe()?;

        let mut in_pipes = Vec::with_capacity(self.worker_count);
        let mut out_pipes = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            in_pipes.push(make_pipe()?);
            out_pipes.push(make_pipe()?);
        }

        let mut command = Command::new(&self.program);
        command.args(&self.extra_args).env(
            spawn::ROLE_ENV_VAR,
            Role::Supervisor {
                worker_count: self.worker_count,
            }
            .env_value(),
        );

        let control_read_fd: RawFd = control_read.into_raw_fd();
        let status_write_fd: RawFd = status_write.into_raw_fd();
        let mut mapping = vec![
            (control_read_fd, spawn::SUPERVISOR_CONTROL_FD),
            (status_write_fd, spawn::SUPERVISOR_STATUS_FD),
        ];
        for (i, (in_pipe, out_pipe)) in in_pipes.iter().zip(out_pipes.iter()).enumerate() {
            let in_read_fd = in_pipe.0.as_raw_fd();
            let out_write_fd = out_pipe.1.as_raw_fd();
            mapping.push((in_read_fd, spawn::supervisor_input_fd(i)));
            mapping.push((out_write_fd, spawn::supervisor_output_fd(i)));
        }

        unsafe {
            spawn::pass_fds(&mut command, mapping);
        }

        let supervisor = command.spawn()?;

        let control_write = unsafe { std::fs::File::from_raw_fd(control_write.into_raw_fd()) };
        let status_read = unsafe { std::fs::File::from_raw_fd(status_read.into_raw_fd()) };

        let mut in_write = HashMap::new();
        let mut out_read = HashMap::new();
        for (i, ((in_r, in_w), (out_r, out_w))) in
            in_pipes.into_iter().zip(out_pipes).enumerate()
        {
            // The supervisor (and its forked children) now hold their own copies of these ends;
            // drop ours.
            drop(in_r);
            drop(out_w);
            in_write.insert(i, unsafe { InputQueueWriter::from_raw_fd(in_w.into_raw_fd()) });
            out_read.insert(i, unsafe { OutputQueueReader::from_raw_fd(out_r.into_raw_fd()) });
        }

        let registry = self.registry.clone();
        thread::spawn(move || mirror_status_events(status_read, registry));

        *self.state.lock().unwrap() = Some(CoordinatorState {
            supervisor,
            control_write,
            in_write,
            out_read,
        });
        info!(worker_count = self.worker_count, msg = "preloaded-fork supervisor started");
        Ok(())
    }

    fn new_process(&self, index: usize) -> Result<(), ProcessManagerError> {
        self.send_control(ControlMessage {
            signal: ProcessControlSignal::Start,
            index,
        })
    }

    fn end_process(&self, index: usize) -> Result<(), ProcessManagerError> {
        self.send_control(ControlMessage {
            signal: ProcessControlSignal::End,
            index,
        })
    }

    fn restart_process(&self, index: usize) -> Result<(), ProcessManagerError> {
        self.send_control(ControlMessage {
            signal: ProcessControlSignal::Restart,
            index,
        })
    }

    fn ensure_healthy(&self) -> Result<(), ProcessManagerError> {
        let mut state = self.state.lock().unwrap();
        let Some(state) = state.as_mut() else {
            return Err(ProcessManagerError::SpawnedForkProcessManagerStartFailure);
        };
        match state.supervisor.try_wait()? {
            Some(_status) => Err(ProcessManagerError::SpawnedForkProcessManagerStartFailure),
            None => Ok(()),
        }
    }

    fn get_process_info(&self, index: usize) -> Result<ProcessInfo, ProcessManagerError> {
        self.registry
            .get_process_info(index, PROCESS_INFO_OBTAINED_TIMEOUT, || self.ensure_healthy())
    }
}

fn mirror_status_events(mut status_read: std::fs::File, registry: ProcessRegistry) {
    loop {
        match recv_frame::<_, StatusEvent>(&mut status_read) {
            Ok(Some(StatusEvent::Inserted(info))) => registry.insert(info),
            Ok(Some(StatusEvent::Removed(index))) => registry.remove(index),
            Ok(None) | Err(_) => return,
        }
    }
}

fn known_supervisor_fds(worker_count: usize) -> Vec<RawFd> {
    let mut fds = vec![spawn::SUPERVISOR_CONTROL_FD, spawn::SUPERVISOR_STATUS_FD];
    for i in 0..worker_count {
        fds.push(spawn::supervisor_input_fd(i));
        fds.push(spawn::supervisor_output_fd(i));
    }
    fds
}

/// Closes every fd in `all` except those in `keep`, best-effort. Called right after `fork(2)` in
/// the child so it ends up with only its own queue pair open, matching the "no inherited fds
/// beyond the queue endpoints" property workers get for free under cold-spawn (§4.3).
fn close_fds_except(all: &[RawFd], keep: &[RawFd]) {
    for &fd in all {
        if !keep.contains(&fd) {
            let _ = nix::unistd::close(fd);
        }
    }
}

/// Waits up to `PROCESS_END_GRACE` for `pid` to exit on its own, then sends SIGTERM and confirms
/// within `PROCESS_TERMINATED_TIMEOUT` that it actually exited. Mirrors the grace-then-force
/// sequence `ColdSpawnManager::end_process` runs over a `std::process::Child`, adapted to
/// `waitpid` since a forked worker has no such handle.
fn terminate_worker(pid: Pid) -> Result<(), ProcessManagerError> {
    let poll_alive = || -> Result<bool, ProcessManagerError> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(true),
            Ok(_) => Ok(false),
            Err(nix::errno::Errno::ECHILD) => Ok(false),
            Err(err) => Err(ProcessManagerError::Io(io::Error::from(err))),
        }
    };

    let deadline = Instant::now() + PROCESS_END_GRACE;
    loop {
        if !poll_alive()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(std::time::Duration::from_millis(50));
    }

    warn!(pid = pid.as_raw(), msg = "worker did not exit voluntarily, terminating");
    let _ = signal::kill(pid, Signal::SIGTERM);
    ensure_process_terminated_within_timeout(PROCESS_TERMINATED_TIMEOUT, poll_alive)
}

struct ForkedWorker {
    pid: Pid,
}

fn fork_worker<F>(
    factory: &F,
    storage_factory: &impl Fn() -> F::Storage,
    index: usize,
    worker_count: usize,
    log_context_init: Option<LogContextInitializer>,
    operation_context: OperationContextSnapshot,
) -> nix::Result<ForkedWorker>
where
    F: ExecutorFactory,
{
    let all_fds = known_supervisor_fds(worker_count);
    match unsafe { nix::unistd::fork()? } {
        ForkResult::Parent { child } => Ok(ForkedWorker { pid: child }),
        ForkResult::Child => {
            let own_input = spawn::supervisor_input_fd(index);
            let own_output = spawn::supervisor_output_fd(index);
            close_fds_except(&all_fds, &[own_input, own_output]);

            let input = unsafe { crate::queues::InputQueueReader::from_raw_fd(own_input) };
            let output = unsafe { crate::queues::OutputQueueWriter::from_raw_fd(own_output) };

            crate::worker::run(
                format!("forked-worker-{index}"),
                factory,
                storage_factory(),
                input,
                output,
                log_context_init,
                operation_context,
            );
            std::process::exit(0);
        }
    }
}

/// The supervisor's own main loop (§4.4, supervisor side), entered from `dispatch_role` in a
/// freshly exec'd process.
pub fn run_supervisor_loop<F>(
    factory: &F,
    storage_factory: impl Fn() -> F::Storage,
    worker_count: usize,
    log_context_init: Option<LogContextInitializer>,
    operation_context: OperationContextSnapshot,
) where
    F: ExecutorFactory,
{
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown_requested.clone();
        let _ = ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        });
    }

    // Warm up whatever caches the factory builds internally; forked children inherit them via
    // copy-on-write, which is why a single shared `create()` method is enough here (no separate
    // reinstantiation closure is needed the way a non-forking runtime would require).
    let _warm = factory.create(storage_factory());

    let mut live: HashMap<usize, Pid> = HashMap::new();
    let mut status_write = unsafe { std::fs::File::from_raw_fd(spawn::SUPERVISOR_STATUS_FD) };

    for index in 0..worker_count {
        match fork_worker(
            factory,
            &storage_factory,
            index,
            worker_count,
            log_context_init.clone(),
            operation_context.clone(),
        ) {
            Ok(worker) => {
                live.insert(index, worker.pid);
                let info = ProcessInfo {
                    index,
                    pid: worker.pid.as_raw() as u32,
                    name: format!("forked-worker-{index}"),
                };
                let _ = send_frame(&mut status_write, &StatusEvent::Inserted(info));
            }
            Err(err) => error!(index, error = %err, msg = "failed to fork worker"),
        }
    }

    let control_read = unsafe { std::fs::File::from_raw_fd(spawn::SUPERVISOR_CONTROL_FD) };
    let control_rx = forward_control_queue(control_read);

    loop {
        reap_dead_children(&mut live, &mut status_write);

        if shutdown_requested.load(Ordering::SeqCst) {
            info!(msg = "supervisor shutting down on SIGINT");
            for &pid in live.values() {
                let _ = signal::kill(pid, Signal::SIGTERM);
            }
            reap_dead_children(&mut live, &mut status_write);
            break;
        }

        match control_rx.recv_timeout(SUPERVISOR_POLL_INTERVAL) {
            Ok(ControlMessage { signal, index }) => {
                handle_control_signal(
                    signal,
                    index,
                    factory,
                    &storage_factory,
                    worker_count,
                    &log_context_init,
                    &operation_context,
                    &mut live,
                    &mut status_write,
                );
            }
            Err(RecvTimeoutError::Timeout) => {
                if live.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    std::process::exit(0);
}

fn forward_control_queue(mut control_read: std::fs::File) -> Receiver<ControlMessage> {
    let (tx, rx): (Sender<ControlMessage>, Receiver<ControlMessage>) = unbounded();
    thread::spawn(move || loop {
        match recv_frame::<_, ControlMessage>(&mut control_read) {
            Ok(Some(message)) => {
                if tx.send(message).is_err() {
                    return;
                }
            }
            Ok(None) | Err(_) => return,
        }
    });
    rx
}

fn reap_dead_children(live: &mut HashMap<usize, Pid>, status_write: &mut std::fs::File) {
    let mut gone = Vec::new();
    for (&index, &pid) in live.iter() {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) => gone.push(index),
            Err(_) => gone.push(index),
        }
    }
    for index in gone {
        live.remove(&index);
        let _ = send_frame(status_write, &StatusEvent::Removed(index));
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_control_signal<F>(
    signal: ProcessControlSignal,
    index: usize,
    factory: &F,
    storage_factory: &impl Fn() -> F::Storage,
    worker_count: usize,
    log_context_init: &Option<LogContextInitializer>,
    operation_context: &OperationContextSnapshot,
    live: &mut HashMap<usize, Pid>,
    status_write: &mut std::fs::File,
) where
    F: ExecutorFactory,
{
    match signal {
        ProcessControlSignal::End => {
            if let Some(pid) = live.remove(&index) {
                if let Err(err) = terminate_worker(pid) {
                    error!(index, error = %err, msg = "failed to confirm worker termination");
                }
                let _ = send_frame(status_write, &StatusEvent::Removed(index));
            }
        }
        ProcessControlSignal::Start => {
            start_one(
                factory,
                storage_factory,
                index,
                worker_count,
                log_context_init,
                operation_context,
                live,
                status_write,
            );
        }
        ProcessControlSignal::Restart => {
            if let Some(pid) = live.remove(&index) {
                if let Err(err) = terminate_worker(pid) {
                    error!(index, error = %err, msg = "failed to confirm worker termination");
                }
                let _ = send_frame(status_write, &StatusEvent::Removed(index));
            }
            start_one(
                factory,
                storage_factory,
                index,
                worker_count,
                log_context_init,
                operation_context,
                live,
                status_write,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn start_one<F>(
    factory: &F,
    storage_factory: &impl Fn() -> F::Storage,
    index: usize,
    worker_count: usize,
    log_context_init: &Option<LogContextInitializer>,
    operation_context: &OperationContextSnapshot,
    live: &mut HashMap<usize, Pid>,
    status_write: &mut std::fs::File,
) where
    F: ExecutorFactory,
{
    match fork_worker(
        factory,
        storage_factory,
        index,
        worker_count,
        log_context_init.clone(),
        operation_context.clone(),
    ) {
        Ok(worker) => {
            live.insert(index, worker.pid);
            let info = ProcessInfo {
                index,
                pid: worker.pid.as_raw() as u32,
                name: format!("forked-worker-{index}"),
            };
            let _ = send_frame(status_write, &StatusEvent::Inserted(info));
        }
        Err(err) => {
            warn!(index, error = %err, msg = "failed to fork replacement worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_round_trips_through_a_pipe() {
        let mut buf = Vec::new();
        send_frame(
            &mut buf,
            &ControlMessage {
                signal: ProcessControlSignal::Restart,
                index: 2,
            },
        )
        .unwrap();

        let mut cursor = io::Cursor::new(buf);
        let decoded: ControlMessage = recv_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.index, 2);
        assert!(matches!(decoded.signal, ProcessControlSignal::Restart));
    }

    #[test]
    fn status_event_round_trips_through_a_pipe() {
        let mut buf = Vec::new();
        send_frame(
            &mut buf,
            &StatusEvent::Inserted(ProcessInfo {
                index: 1,
                pid: 999,
                name: "forked-worker-1".to_string(),
            }),
        )
        .unwrap();

        let mut cursor = io::Cursor::new(buf);
        let decoded: StatusEvent = recv_frame(&mut cursor).unwrap().unwrap();
        match decoded {
            StatusEvent::Inserted(info) => assert_eq!(info.pid, 999),
            StatusEvent::Removed(_) => panic!("expected Inserted"),
        }
    }

    #[test]
    fn close_fds_except_closes_everything_not_kept() {
        let (a_read, a_write) = make_pipe().unwrap();
        let (b_read, b_write) = make_pipe().unwrap();
        let a_read_fd = a_read.into_raw_fd();
        let a_write_fd = a_write.into_raw_fd();
        let b_read_fd = b_read.into_raw_fd();
        let b_write_fd = b_write.into_raw_fd();

        close_fds_except(
            &[a_read_fd, a_write_fd, b_read_fd, b_write_fd],
            &[b_read_fd, b_write_fd],
        );

        assert!(nix::fcntl::fcntl(a_read_fd, nix::fcntl::FcntlArg::F_GETFD).is_err());
        assert!(nix::fcntl::fcntl(a_write_fd, nix::fcntl::FcntlArg::F_GETFD).is_err());
        assert!(nix::fcntl::fcntl(b_read_fd, nix::fcntl::FcntlArg::F_GETFD).is_ok());

        let _ = nix::unistd::close(b_read_fd);
        let _ = nix::unistd::close(b_write_fd);
    }
}
