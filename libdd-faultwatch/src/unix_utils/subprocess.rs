// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, synchronous subprocess execution that can run inside a signal handler.
//!
//! Nothing here allocates: argument vectors are built in fixed arrays and stdout is captured
//! into a caller-provided buffer.

use super::{reap_or_kill, Deadline, ReapError};
use libc::{c_char, c_int};
use nix::errno::Errno;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::ffi::CStr;
use std::ptr;
use std::time::Duration;

/// Longest argument vector a subprocess can be given.
pub const MAX_ARGS: usize = 15;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error("No program given")]
    EmptyCommand,
    #[error("Too many arguments: {0} > {MAX_ARGS}")]
    TooManyArgs(usize),
    #[error("Failed to create pipe: {0}")]
    Pipe(Errno),
    #[error("Failed to fork: {0}")]
    Fork(Errno),
    #[error("Poll failed with errno: {0}")]
    Poll(Errno),
    #[error("Subprocess did not finish in time")]
    Timeout,
    #[error(transparent)]
    Reap(#[from] ReapError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutput {
    /// Bytes of stdout captured into the caller's buffer.
    pub len: usize,
    /// Exit code, if the child exited normally.
    pub status: Option<i32>,
}

/// Runs a command line and captures a bounded amount of its stdout.
pub trait SubprocessRunner {
    /// `argv[0]` must be a path to the program; it is not looked up in `PATH`.
    fn run(&self, argv: &[&CStr], stdout: &mut [u8]) -> Result<RunOutput, RunError>;
}

impl<T: SubprocessRunner + ?Sized> SubprocessRunner for &T {
    fn run(&self, argv: &[&CStr], stdout: &mut [u8]) -> Result<RunOutput, RunError> {
        (**self).run(argv, stdout)
    }
}

/// Plain fork/exec, bounded by a deadline. The child is killed if it does not finish in time.
#[derive(Debug, Clone, Copy)]
pub struct ForkExecRunner {
    timeout: Duration,
}

impl ForkExecRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

struct Pipe {
    read: c_int,
    write: c_int,
}

impl Pipe {
    fn new() -> Result<Self, Errno> {
        let mut fds = [-1 as c_int; 2];
        // SAFETY: `fds` has room for the two descriptors.
        Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        Ok(Self {
            read: fds[0],
            write: fds[1],
        })
    }
}

fn close(fd: c_int) {
    if fd >= 0 {
        // SAFETY: closing a descriptor we own.
        unsafe { libc::close(fd) };
    }
}

/// Fork without running `pthread_atfork` handlers: the parent may have crashed while holding a
/// lock one of them wants.
#[cfg(target_os = "linux")]
fn fork_without_atfork() -> libc::pid_t {
    // SAFETY: with a null stack pointer, clone behaves like fork.
    let res = unsafe {
        libc::syscall(
            libc::SYS_clone,
            libc::SIGCHLD as libc::c_ulong,
            ptr::null_mut::<libc::c_void>(),
            ptr::null_mut::<libc::pid_t>(),
            ptr::null_mut::<libc::pid_t>(),
            0 as libc::c_ulong,
        )
    };
    res.clamp(libc::pid_t::MIN as libc::c_long, libc::pid_t::MAX as libc::c_long) as libc::pid_t
}

#[cfg(not(target_os = "linux"))]
fn fork_without_atfork() -> libc::pid_t {
    // There is no raw clone on macOS; live with the atfork handlers.
    unsafe { libc::fork() }
}

/// Only async-signal-safe calls from here on: this runs in the forked child.
unsafe fn exec_child(pipe: &Pipe, argv: *const *const c_char) -> ! {
    close(pipe.read);
    if libc::dup2(pipe.write, libc::STDOUT_FILENO) < 0 {
        libc::_exit(126);
    }
    close(pipe.write);
    let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
    if devnull >= 0 {
        libc::dup2(devnull, libc::STDIN_FILENO);
        libc::dup2(devnull, libc::STDERR_FILENO);
        close(devnull);
    }
    let envp: [*const c_char; 1] = [ptr::null()];
    libc::execve(*argv, argv, envp.as_ptr());
    libc::_exit(127)
}

fn drain(fd: c_int, stdout: &mut [u8], deadline: &Deadline) -> Result<usize, RunError> {
    let mut len = 0;
    let mut scratch = [0u8; 256];
    loop {
        let mut poll_fds = [libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(poll_fds.as_mut_ptr(), 1, deadline.poll_timeout_ms()) };
        match rc {
            -1 => match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                e => return Err(RunError::Poll(e)),
            },
            0 => return Err(RunError::Timeout),
            _ => {}
        }
        // Keep draining past a full buffer so the child never blocks on a full pipe.
        let target: &mut [u8] = if len < stdout.len() {
            &mut stdout[len..]
        } else {
            &mut scratch
        };
        // SAFETY: `target` is a live, writable buffer of the given length.
        let n = unsafe { libc::read(fd, target.as_mut_ptr().cast(), target.len()) };
        match n {
            0 => return Ok(len),
            n if n > 0 => {
                if len < stdout.len() {
                    len += n as usize;
                }
            }
            _ => match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                _ => return Ok(len),
            },
        }
    }
}

impl SubprocessRunner for ForkExecRunner {
    fn run(&self, argv: &[&CStr], stdout: &mut [u8]) -> Result<RunOutput, RunError> {
        if argv.is_empty() {
            return Err(RunError::EmptyCommand);
        }
        if argv.len() > MAX_ARGS {
            return Err(RunError::TooManyArgs(argv.len()));
        }
        let mut argv_ptrs: [*const c_char; MAX_ARGS + 1] = [ptr::null(); MAX_ARGS + 1];
        for (slot, arg) in argv_ptrs.iter_mut().zip(argv) {
            *slot = arg.as_ptr();
        }

        let deadline = Deadline::after(self.timeout);
        let pipe = Pipe::new().map_err(RunError::Pipe)?;
        let pid = fork_without_atfork();
        if pid < 0 {
            let err = Errno::last();
            close(pipe.read);
            close(pipe.write);
            return Err(RunError::Fork(err));
        }
        if pid == 0 {
            // SAFETY: we are the child; `argv_ptrs` is NUL terminated.
            unsafe { exec_child(&pipe, argv_ptrs.as_ptr()) }
        }

        close(pipe.write);
        let drained = drain(pipe.read, stdout, &deadline);
        close(pipe.read);

        // The child has closed stdout (or run out of time); give it what is left of the budget to
        // exit, then kill it.
        let status = reap_or_kill(Pid::from_raw(pid), &deadline)?;
        let len = drained?;
        let status = match status {
            Some(WaitStatus::Exited(_, code)) => Some(code),
            _ => None,
        };
        Ok(RunOutput { len, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_captures_stdout_and_status() {
        let runner = ForkExecRunner::new(Duration::from_secs(5));
        let mut out = [0u8; 64];
        let result = runner
            .run(&[c"/bin/sh", c"-c", c"printf 'hello'; exit 3"], &mut out)
            .unwrap();
        assert_eq!(&out[..result.len], b"hello");
        assert_eq!(result.status, Some(3));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_output_is_bounded() {
        let runner = ForkExecRunner::new(Duration::from_secs(5));
        let mut out = [0u8; 8];
        let result = runner
            .run(&[c"/bin/sh", c"-c", c"yes | head -c 100000"], &mut out)
            .unwrap();
        assert_eq!(result.len, 8);
        assert_eq!(&out, b"y\ny\ny\ny\n");
        assert_eq!(result.status, Some(0));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_slow_child_is_killed() {
        let runner = ForkExecRunner::new(Duration::from_millis(100));
        let mut out = [0u8; 8];
        let start = std::time::Instant::now();
        let result = runner.run(&[c"/bin/sh", c"-c", c"sleep 30"], &mut out);
        assert_eq!(result, Err(RunError::Timeout));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_missing_program() {
        let runner = ForkExecRunner::new(Duration::from_secs(5));
        let mut out = [0u8; 8];
        let result = runner
            .run(&[c"/nonexistent/definitely-not-here"], &mut out)
            .unwrap();
        assert_eq!(result.len, 0);
        assert_eq!(result.status, Some(127));
    }

    #[test]
    fn test_argument_limits() {
        let runner = ForkExecRunner::new(Duration::from_secs(1));
        let mut out = [0u8; 8];
        assert_eq!(runner.run(&[], &mut out), Err(RunError::EmptyCommand));
        let many = [c"x"; MAX_ARGS + 1];
        assert_eq!(
            runner.run(&many, &mut out),
            Err(RunError::TooManyArgs(MAX_ARGS + 1))
        );
    }
}
