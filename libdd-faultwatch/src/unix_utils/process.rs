// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Deadline;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::Duration;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ReapError {
    #[error("child {0} was still running when its deadline passed")]
    StillRunning(Pid),
    #[error("waitpid failed: {0}")]
    Wait(#[from] nix::Error),
}

/// Leaves immediately with status 1, skipping atexit handlers and abort.
pub fn terminate() -> ! {
    // SAFETY: `_exit` has no preconditions.
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// One `waitpid` call, retried on EINTR. A child that is already gone maps to `None`.
fn wait_once(pid: Pid, flags: Option<WaitPidFlag>) -> Result<Option<WaitStatus>, ReapError> {
    loop {
        return match waitpid(pid, flags) {
            Err(nix::Error::EINTR) => continue,
            Err(nix::Error::ECHILD) => Ok(None),
            Err(e) => Err(ReapError::Wait(e)),
            Ok(status) => Ok(Some(status)),
        };
    }
}

/// Polls `pid` with `WNOHANG` until it exits or `deadline` passes. Only `waitpid` and
/// `nanosleep` are called, both async-signal-safe.
pub fn reap_before(pid: Pid, deadline: &Deadline) -> Result<Option<WaitStatus>, ReapError> {
    loop {
        match wait_once(pid, Some(WaitPidFlag::WNOHANG))? {
            Some(WaitStatus::StillAlive) if deadline.passed() => {
                return Err(ReapError::StillRunning(pid))
            }
            Some(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(1)),
            other => return Ok(other),
        }
    }
}

/// Like [`reap_before`], but a child still running at the deadline gets SIGKILL and is then
/// waited for without a limit.
pub fn reap_or_kill(pid: Pid, deadline: &Deadline) -> Result<Option<WaitStatus>, ReapError> {
    match reap_before(pid, deadline) {
        Err(ReapError::StillRunning(pid)) => {
            let _ = kill(pid, Signal::SIGKILL);
            wait_once(pid, None)
        }
        other => other,
    }
}
