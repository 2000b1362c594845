//! The per-worker input/output queues (§3, §4.2) and the wire envelopes carried on them.
//!
//! Every queue in this crate is, physically, a Unix pipe plus the length-prefixed JSON framing
//! from `wire.rs`. A worker's side of the pipe is read/written directly inside its single
//! cooperative loop (`worker::run`); the coordinator's side is fanned out onto a
//! `crossbeam::channel` by a forwarding thread, because the coordinator is multi-threaded and
//! freely concurrent (§5) and must be able to read N output queues without blocking on any one
//! of them.

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{de::DeserializeOwned, Serialize};

use crate::wire::{recv_frame, send_frame};

/// One item flowing through an input queue: either a request to execute or the terminate
/// sentinel (§3: InputQueue, §4.2 step 5).
#[derive(Debug, Serialize, serde::Deserialize)]
pub enum WorkItem<Req> {
    Run { correlation_id: u64, payload: Req },
    Terminate,
}

/// One item flowing through an output queue: the successful result or a structured error,
/// tagged with the correlation id of the request it answers (§3: Result).
#[derive(Debug, Serialize, serde::Deserialize)]
pub enum WorkOutcome<Res> {
    Success {
        correlation_id: u64,
        payload: Res,
    },
    Failure {
        correlation_id: u64,
        error: crate::errors::SerializedWorkerError,
    },
}

/// Creates a pipe and returns both ends as raw, not-yet-owned file descriptors, both marked
/// close-on-exec. A worker or supervisor that needs an end to survive `exec(3)` gets it through
/// `spawn::pass_fds`, which re-duplicates it onto a fixed target fd without CLOEXEC; every other
/// fd this process holds is therefore closed automatically by the kernel during `exec(3)`, which
/// is the "no inherited file descriptors other than the queue endpoints" requirement (§4.3).
pub fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read_fd, write_fd) =
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    unsafe { Ok((OwnedFd::from_raw_fd(read_fd), OwnedFd::from_raw_fd(write_fd))) }
}

/// The worker-side end of an input queue: a blocking reader used directly inside the
/// single-threaded worker loop.
pub struct InputQueueReader<Req> {
    file: File,
    _marker: std::marker::PhantomData<Req>,
}

impl<Req: DeserializeOwned> InputQueueReader<Req> {
    /// # Safety
    /// `fd` must be an open, owned file descriptor valid for reading that nothing else in this
    /// process holds a competing owner for.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            file: File::from_raw_fd(fd),
            _marker: std::marker::PhantomData,
        }
    }

    /// Blocks until a `WorkItem` arrives or the coordinator drops its end of the pipe, in which
    /// case this returns `Ok(None)` and the worker should treat it the same as a terminate
    /// sentinel.
    pub fn recv(&mut self) -> io::Result<Option<WorkItem<Req>>> {
        recv_frame(&mut self.file)
    }
}

/// The coordinator-side end of an input queue.
pub struct InputQueueWriter<Req> {
    file: File,
    _marker: std::marker::PhantomData<Req>,
}

impl<Req: Serialize> InputQueueWriter<Req> {
    /// # Safety
    /// `fd` must be an open, owned file descriptor valid for writing.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            file: File::from_raw_fd(fd),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn send_request(&mut self, correlation_id: u64, payload: Req) -> io::Result<()> {
        send_frame(
            &mut self.file,
            &WorkItem::Run {
                correlation_id,
                payload,
            },
        )
    }

    pub fn send_terminate(&mut self) -> io::Result<()> {
        send_frame(&mut self.file, &WorkItem::<Req>::Terminate)
    }
}

/// The worker-side end of an output queue.
pub struct OutputQueueWriter<Res> {
    file: File,
    _marker: std::marker::PhantomData<Res>,
}

impl<Res: Serialize> OutputQueueWriter<Res> {
    /// # Safety
    /// `fd` must be an open, owned file descriptor valid for writing.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            file: File::from_raw_fd(fd),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn send(&mut self, outcome: WorkOutcome<Res>) -> io::Result<()> {
        send_frame(&mut self.file, &outcome)
    }
}

/// The coordinator-side end of an output queue: a background thread drains raw frames off the
/// pipe and republishes them on a `crossbeam::channel` so any coordinator thread can consume
/// results without owning the file descriptor.
pub struct OutputQueueReader<Res> {
    rx: Receiver<WorkOutcome<Res>>,
    _thread: JoinHandle<()>,
}

impl<Res> OutputQueueReader<Res>
where
    Res: DeserializeOwned + Send + 'static,
{
    /// # Safety
    /// `fd` must be an open, owned file descriptor valid for reading.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        let mut file = File::from_raw_fd(fd);
        let (tx, rx) = unbounded();
        let thread = thread::spawn(move || pump_output_queue(&mut file, &tx));
        Self { rx, _thread: thread }
    }

    pub fn receiver(&self) -> &Receiver<WorkOutcome<Res>> {
        &self.rx
    }
}

fn pump_output_queue<Res: DeserializeOwned>(file: &mut File, tx: &Sender<WorkOutcome<Res>>) {
    loop {
        match recv_frame::<_, WorkOutcome<Res>>(file) {
            Ok(Some(outcome)) => {
                if tx.send(outcome).is_err() {
                    return;
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

/// A file-descriptor-to-pipe-role map used when building the `Command` that cold-spawns a worker
/// or the supervisor for fork mode (see `spawn::pass_fds`). Fixed numbering starting at 3 keeps
/// the bootstrap on the child side (`spawn::dispatch_role`) trivial: it just opens the fds it was
/// told about by number.
pub const FIRST_PASSED_FD: RawFd = 3;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    #[test]
    fn request_round_trips_through_a_real_pipe() {
        let (read_fd, write_fd) = make_pipe().unwrap();
        let mut writer: InputQueueWriter<i32> =
            unsafe { InputQueueWriter::from_raw_fd(write_fd.into_raw_fd()) };
        let mut reader: InputQueueReader<i32> =
            unsafe { InputQueueReader::from_raw_fd(read_fd.into_raw_fd()) };

        writer.send_request(7, 42).unwrap();
        writer.send_terminate().unwrap();

        match reader.recv().unwrap().unwrap() {
            WorkItem::Run { correlation_id, payload } => {
                assert_eq!(correlation_id, 7);
                assert_eq!(payload, 42);
            }
            WorkItem::Terminate => panic!("expected a Run item first"),
        }
        assert!(matches!(reader.recv().unwrap().unwrap(), WorkItem::Terminate));
    }

    #[test]
    fn output_queue_reader_pumps_frames_onto_a_channel() {
        let (read_fd, write_fd) = make_pipe().unwrap();
        let mut writer: OutputQueueWriter<String> =
            unsafe { OutputQueueWriter::from_raw_fd(write_fd.into_raw_fd()) };
        let reader: OutputQueueReader<String> =
            unsafe { OutputQueueReader::from_raw_fd(read_fd.into_raw_fd()) };

        writer
            .send(WorkOutcome::Success {
                correlation_id: 1,
                payload: "hi".to_string(),
            })
            .unwrap();

        let outcome = reader.receiver().recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        match outcome {
            WorkOutcome::Success { correlation_id, payload } => {
                assert_eq!(correlation_id, 1);
                assert_eq!(payload, "hi");
            }
            WorkOutcome::Failure { .. } => panic!("unexpected failure"),
        }
    }

    #[test]
    fn eof_on_the_input_pipe_is_reported_as_none() {
        let (read_fd, write_fd) = make_pipe().unwrap();
        drop(unsafe { File::from_raw_fd(write_fd.into_raw_fd()) });
        let mut reader: InputQueueReader<i32> =
            unsafe { InputQueueReader::from_raw_fd(read_fd.into_raw_fd()) };
        assert!(reader.recv().unwrap().is_none());
    }
}
