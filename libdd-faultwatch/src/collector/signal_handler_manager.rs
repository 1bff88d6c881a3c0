// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_handler::handle_fault_signal;
use super::emitters::write_to_fd;
use super::siginfo_strings::{is_valid_signum, signal_name};
use crate::shared::constants::{MAX_INTERCEPTED_SIGNALS, SMALL_BUF_SIZE};
use crate::shared::fixed_buf::FixedBuf;
use nix::errno::Errno;
use std::fmt::Write;
use std::os::fd::RawFd;
use std::ptr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignalRegistryError {
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),
    #[error("unable to install a handler for signal {signum}: {errno}")]
    Install { signum: i32, errno: Errno },
    #[error("unable to restore the handler for signal {signum}: {errno}")]
    Restore { signum: i32, errno: Errno },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStatus {
    Registered,
    AlreadyRegistered,
    TableFull,
    /// The signal belongs to the timeout watchdog.
    Reserved,
    NotInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregisterStatus {
    Restored,
    NotRegistered,
    NotInitialized,
}

/// A signal we installed a handler for, and what was there before.
#[derive(Clone, Copy)]
pub struct InterceptedSignal {
    pub signum: i32,
    pub previous: libc::sigaction,
}

impl std::fmt::Debug for InterceptedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptedSignal")
            .field("signum", &self.signum)
            .field("previous_handler", &self.previous.sa_sigaction)
            .finish()
    }
}

fn is_own_handler(action: &libc::sigaction) -> bool {
    action.sa_sigaction == handle_fault_signal as libc::sighandler_t
}

/// Installs the crash handler for `signum`, returning the disposition it replaced.
///
/// The handler runs with `SA_NODEFER` so that re-raising from inside it is delivered right away,
/// and with `SA_ONSTACK` when `on_alt_stack` is set.
///
/// If the crash handler was already installed for `signum`, the returned disposition is the
/// default one: restoring it must never route the signal back into the crash handler.
pub fn install_handler(signum: i32, on_alt_stack: bool) -> Result<libc::sigaction, Errno> {
    // SAFETY: all-zero is a valid `sigaction`; every field we rely on is set below.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_fault_signal as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    if on_alt_stack {
        action.sa_flags |= libc::SA_ONSTACK;
    }
    // SAFETY: the mask is a field of a live struct.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    // SAFETY: as above.
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers reference live structs; the handler is an `extern "C"` fn with the
    // `SA_SIGINFO` signature.
    Errno::result(unsafe { libc::sigaction(signum, &action, &mut previous) })?;
    if is_own_handler(&previous) {
        // SAFETY: all-zero is SIG_DFL with no flags.
        previous = unsafe { std::mem::zeroed() };
    }
    Ok(previous)
}

/// Puts back a saved disposition. Async-signal-safe.
pub fn restore_handler(signal: &InterceptedSignal) -> Result<(), Errno> {
    // SAFETY: `previous` is a disposition the kernel handed back to us.
    Errno::result(unsafe { libc::sigaction(signal.signum, &signal.previous, ptr::null_mut()) })
        .map(drop)
}

/// Resets `signum` to the default disposition. Async-signal-safe.
pub fn restore_default(signum: i32) {
    // SAFETY: SIG_DFL is valid for every catchable signal.
    unsafe { libc::signal(signum, libc::SIG_DFL) };
}

/// Best-effort restore of every entry. Takes no lock and does not allocate: failures are
/// reported as one bounded line each on `fd`.
pub fn revert_all<'a>(signals: impl IntoIterator<Item = &'a InterceptedSignal>, fd: RawFd) {
    for signal in signals {
        if let Err(errno) = restore_handler(signal) {
            let mut line = FixedBuf::<SMALL_BUF_SIZE>::new();
            let _ = writeln!(
                line,
                "{}",
                SignalRegistryError::Restore {
                    signum: signal.signum,
                    errno
                }
            );
            write_to_fd(fd, line.as_bytes());
        }
    }
}

/// Insertion-ordered table of intercepted signals. Copied wholesale into every published
/// snapshot so the fault path can revert without touching shared state.
#[derive(Clone, Copy)]
pub struct SignalTable {
    entries: [Option<InterceptedSignal>; MAX_INTERCEPTED_SIGNALS],
    len: usize,
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|s| signal_name(s.signum)))
            .finish()
    }
}

impl SignalTable {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_INTERCEPTED_SIGNALS],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, signum: i32) -> bool {
        self.iter().any(|s| s.signum == signum)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterceptedSignal> {
        self.entries[..self.len].iter().flatten()
    }

    pub fn signums(&self) -> impl Iterator<Item = i32> + '_ {
        self.iter().map(|s| s.signum)
    }

    fn push(&mut self, signal: InterceptedSignal) -> bool {
        if self.len == MAX_INTERCEPTED_SIGNALS {
            return false;
        }
        self.entries[self.len] = Some(signal);
        self.len += 1;
        true
    }

    fn remove(&mut self, signum: i32) -> Option<InterceptedSignal> {
        let index = self.iter().position(|s| s.signum == signum)?;
        let removed = self.entries[index];
        self.entries.copy_within(index + 1..self.len, index);
        self.len -= 1;
        self.entries[self.len] = None;
        removed
    }

    /// Installs the crash handler for `signum` and remembers the previous disposition.
    /// Registering a signal twice is a no-op.
    pub fn register(
        &mut self,
        signum: i32,
        on_alt_stack: bool,
    ) -> Result<RegisterStatus, SignalRegistryError> {
        if !is_valid_signum(signum) {
            return Err(SignalRegistryError::InvalidSignal(signum));
        }
        if self.contains(signum) {
            return Ok(RegisterStatus::AlreadyRegistered);
        }
        if self.len == MAX_INTERCEPTED_SIGNALS {
            return Ok(RegisterStatus::TableFull);
        }
        let previous = install_handler(signum, on_alt_stack)
            .map_err(|errno| SignalRegistryError::Install { signum, errno })?;
        self.push(InterceptedSignal { signum, previous });
        Ok(RegisterStatus::Registered)
    }

    /// Restores the previous disposition of `signum` and forgets it.
    pub fn deregister(&mut self, signum: i32) -> Result<DeregisterStatus, SignalRegistryError> {
        let Some(signal) = self.iter().find(|s| s.signum == signum).copied() else {
            return Ok(DeregisterStatus::NotRegistered);
        };
        restore_handler(&signal).map_err(|errno| SignalRegistryError::Restore { signum, errno })?;
        self.remove(signum);
        Ok(DeregisterStatus::Restored)
    }

    /// Restores every disposition and empties the table.
    pub fn revert_all(&mut self, fd: RawFd) {
        revert_all(self.iter(), fd);
        *self = Self::new();
    }
}
