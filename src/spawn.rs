//! Cross-`exec` file-descriptor plumbing and the process-role bootstrap (§2.1, ADDED).
//!
//! A cold-spawned worker or a preloaded-fork supervisor is, physically, the same compiled binary
//! re-exec'd with an internal environment-variable marker. Every fd this crate hands to such a
//! child is passed at a **fixed** number (starting at [`crate::queues::FIRST_PASSED_FD`]) using
//! the classic fd-rearrangement trick: duplicate sources above the target range first, then
//! `dup2` them down onto their final numbers inside a `pre_exec` hook, so chains and collisions
//! between source and destination numbers can never clobber each other. Every other descriptor
//! this process holds is opened close-on-exec (the default for anything `nix`/`std` opens here)
//! and is therefore closed automatically by the kernel during `exec(3)` — which is exactly the
//! "no inherited file descriptors other than the queue endpoints" requirement from §4.3.

use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::dup2;

pub const ROLE_ENV_VAR: &str = "FLOW_WORKER_POOL_ROLE";

/// Marks a freshly created fd as close-on-exec, so it never leaks into a child this process
/// spawns except through an explicit [`pass_fds`] mapping.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    Ok(())
}

/// Arranges for `mapping` (source fd in this process -> target fd in the child) to survive
/// `exec(3)` in the command about to be spawned. Must be called before `.spawn()`.
///
/// # Safety
/// The closure registered here runs in the forked child between `fork(2)` and `exec(3)`; it may
/// only call async-signal-safe functions, which `dup2`/`close` are.
pub unsafe fn pass_fds(command: &mut Command, mapping: Vec<(RawFd, RawFd)>) {
    command.pre_exec(move || {
        let max_target = mapping.iter().map(|(_, dst)| *dst).max().unwrap_or(0);

        // Phase 1: move every source above the whole target range so a source can never alias a
        // not-yet-written destination.
        let mut staged = Vec::with_capacity(mapping.len());
        for &(src, dst) in &mapping {
            let tmp = fcntl(src, FcntlArg::F_DUPFD_CLOEXEC(max_target + 1))?;
            staged.push((tmp, dst));
        }

        // Phase 2: drop the staged copies onto their final, non-cloexec numbers.
        for (tmp, dst) in staged {
            dup2(tmp, dst)?;
            if tmp != dst {
                let _ = nix::unistd::close(tmp);
            }
        }
        Ok(())
    });
}

/// The role a re-exec'd child was asked to play, decoded from [`ROLE_ENV_VAR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A single cold-spawned worker at this index, talking on fds 3 (input, read) and 4 (output,
    /// write).
    Worker { index: usize },
    /// The preloaded-fork supervisor for `worker_count` workers. Fd layout: 3 = control queue
    /// (read), 4 = ProcessInfo status channel (write), then for worker `i`: `5 + 2*i` = input
    /// (read), `6 + 2*i` = output (write).
    Supervisor { worker_count: usize },
}

impl Role {
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(ROLE_ENV_VAR).ok()?;
        let (kind, rest) = raw.split_once(':')?;
        match kind {
            "worker" => rest.parse().ok().map(|index| Role::Worker { index }),
            "supervisor" => rest.parse().ok().map(|worker_count| Role::Supervisor { worker_count }),
            _ => None,
        }
    }

    pub fn env_value(&self) -> String {
        match self {
            Role::Worker { index } => format!("worker:{index}"),
            Role::Supervisor { worker_count } => format!("supervisor:{worker_count}"),
        }
    }
}

pub const WORKER_INPUT_FD: RawFd = crate::queues::FIRST_PASSED_FD;
pub const WORKER_OUTPUT_FD: RawFd = crate::queues::FIRST_PASSED_FD + 1;
pub const SUPERVISOR_CONTROL_FD: RawFd = crate::queues::FIRST_PASSED_FD;
pub const SUPERVISOR_STATUS_FD: RawFd = crate::queues::FIRST_PASSED_FD + 1;

pub fn supervisor_input_fd(index: usize) -> RawFd {
    SUPERVISOR_STATUS_FD + 1 + (2 * index as RawFd)
}

pub fn supervisor_output_fd(index: usize) -> RawFd {
    supervisor_input_fd(index) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_env_value() {
        assert_eq!(Role::Worker { index: 3 }.env_value(), "worker:3");
        assert_eq!(
            Role::Supervisor { worker_count: 5 }.env_value(),
            "supervisor:5"
        );
    }

    #[test]
    fn supervisor_fd_layout_is_contiguous_and_disjoint() {
        let fds: Vec<RawFd> = (0..4)
            .flat_map(|i| [supervisor_input_fd(i), supervisor_output_fd(i)])
            .collect();
        assert_eq!(fds, vec![5, 6, 7, 8, 9, 10, 11, 12]);
    }
}
