// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Execution deadline. A dedicated thread sleeps until the deadline and then delivers the
//! timeout signal to the process, which lands in the crash handler like any other fault.

use super::signal_handler_manager::{install_handler, restore_handler, InterceptedSignal};
use nix::errno::Errno;
use std::borrow::Cow;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Set by the watchdog right before it delivers the timeout signal.
pub(crate) static TIMEOUT_REACHED: AtomicBool = AtomicBool::new(false);

const WATCHDOG_THREAD_NAME: &str = "faultwatch-timeout";

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("timeout requested before init")]
    NotInitialized,
    #[error("invalid timeout duration {0} seconds")]
    InvalidDuration(f64),
    #[error("restart requested but no timeout was ever set")]
    NeverSet,
    #[error("unable to install the timeout signal handler: {0}")]
    Install(Errno),
    #[error("unable to restore the timeout signal handler: {0}")]
    Restore(Errno),
    #[error("unable to start the watchdog thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Where a timeout was armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub file: Cow<'static, str>,
    pub line: u32,
}

impl CallSite {
    pub fn new(file: impl Into<Cow<'static, str>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

pub fn validate_duration(seconds: f64) -> Result<Duration, TimeoutError> {
    Duration::try_from_secs_f64(seconds).map_err(|_| TimeoutError::InvalidDuration(seconds))
}

#[derive(Debug, Default)]
struct Deadline {
    at: Option<Instant>,
    shutdown: bool,
}

type Shared = Arc<(Mutex<Deadline>, Condvar)>;

fn lock(shared: &Shared) -> MutexGuard<'_, Deadline> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the watchdog thread. Arming replaces any pending deadline.
#[derive(Debug)]
pub struct Watchdog {
    shared: Shared,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts the thread. `on_expiry` runs on it, with the deadline lock held, each time an armed
    /// deadline passes without being disarmed. `blocked_signal` is masked on the thread so that
    /// the process-directed signal is handled by one of the application's threads.
    pub fn spawn(
        blocked_signal: Option<i32>,
        on_expiry: impl Fn() + Send + 'static,
    ) -> Result<Self, TimeoutError> {
        let shared: Shared = Arc::default();
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(WATCHDOG_THREAD_NAME.to_string())
            .spawn(move || {
                if let Some(signum) = blocked_signal {
                    block_signal(signum);
                }
                run(&thread_shared, on_expiry)
            })?;
        tracing::debug!("Started the {WATCHDOG_THREAD_NAME} thread");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn arm(&self, duration: Duration) {
        let mut deadline = lock(&self.shared);
        deadline.at = Some(Instant::now() + duration);
        self.shared.1.notify_all();
    }

    /// Returns whether a deadline was pending.
    pub fn disarm(&self) -> bool {
        let mut deadline = lock(&self.shared);
        let pending = deadline.at.take().is_some();
        self.shared.1.notify_all();
        pending
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.shared).at.is_some()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut deadline = lock(&self.shared);
            deadline.shutdown = true;
            deadline.at = None;
            self.shared.1.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("The {WATCHDOG_THREAD_NAME} thread panicked");
            }
        }
    }
}

fn run(shared: &Shared, on_expiry: impl Fn()) {
    let (mutex, condvar) = &**shared;
    let mut deadline = mutex.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if deadline.shutdown {
            return;
        }
        match deadline.at {
            None => {
                deadline = condvar
                    .wait(deadline)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    deadline.at = None;
                    on_expiry();
                    continue;
                }
                // Spurious wakeups, re-arming and disarming all land back here and re-read `at`.
                let (guard, _) = condvar
                    .wait_timeout(deadline, at - now)
                    .unwrap_or_else(PoisonError::into_inner);
                deadline = guard;
            }
        }
    }
}

fn block_signal(signum: i32) {
    // SAFETY: the set is initialized by sigemptyset before use; pthread_sigmask only affects
    // the calling thread.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signum);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Delivers `signum` to the whole process.
fn deliver(signum: i32) {
    TIMEOUT_REACHED.store(true, SeqCst);
    // SAFETY: no preconditions.
    unsafe { libc::kill(libc::getpid(), signum) };
}

/// What the fault path needs to know about the active timeout.
#[derive(Debug, Clone)]
pub struct TimeoutView {
    pub seconds: f64,
    pub call_site: CallSite,
    pub handler: InterceptedSignal,
}

/// Timeout bookkeeping kept in the process-wide state.
#[derive(Debug)]
pub struct TimeoutState {
    signal: i32,
    on_alt_stack: bool,
    duration: Option<Duration>,
    call_site: Option<CallSite>,
    /// Present while our handler is installed for `signal`.
    handler: Option<InterceptedSignal>,
    watchdog: Option<Watchdog>,
}

impl TimeoutState {
    pub fn new(signal: i32, on_alt_stack: bool) -> Self {
        Self {
            signal,
            on_alt_stack,
            duration: None,
            call_site: None,
            handler: None,
            watchdog: None,
        }
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }

    pub fn is_armed(&self) -> bool {
        self.watchdog.as_ref().is_some_and(Watchdog::is_armed)
    }

    /// Arms the deadline, replacing any pending one. Installs the handler for the timeout signal
    /// on first use.
    pub fn set(&mut self, seconds: f64, call_site: CallSite) -> Result<(), TimeoutError> {
        let duration = validate_duration(seconds)?;
        if self.handler.is_none() {
            let previous =
                install_handler(self.signal, self.on_alt_stack).map_err(TimeoutError::Install)?;
            self.handler = Some(InterceptedSignal {
                signum: self.signal,
                previous,
            });
        }
        if self.watchdog.is_none() {
            let signal = self.signal;
            self.watchdog = Some(Watchdog::spawn(Some(signal), move || deliver(signal))?);
        }
        TIMEOUT_REACHED.store(false, SeqCst);
        self.duration = Some(duration);
        self.call_site = Some(call_site);
        if let Some(watchdog) = &self.watchdog {
            watchdog.disarm();
            watchdog.arm(duration);
        }
        tracing::debug!(
            seconds,
            call_site = %self.call_site.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Armed timeout"
        );
        Ok(())
    }

    /// Disarms and restores the previous handler. A no-op when nothing is installed.
    pub fn clear(&mut self) -> Result<(), TimeoutError> {
        if let Some(watchdog) = &self.watchdog {
            watchdog.disarm();
        }
        if let Some(handler) = self.handler.take() {
            restore_handler(&handler).map_err(TimeoutError::Restore)?;
            tracing::debug!("Cleared timeout");
        }
        TIMEOUT_REACHED.store(false, SeqCst);
        Ok(())
    }

    /// Re-arms with the last configured duration.
    pub fn restart(&mut self, call_site: CallSite) -> Result<(), TimeoutError> {
        let duration = self.duration.ok_or(TimeoutError::NeverSet)?;
        self.set(duration.as_secs_f64(), call_site)
    }

    /// Clears and stops the watchdog thread.
    pub fn shutdown(&mut self) -> Result<(), TimeoutError> {
        let res = self.clear();
        self.watchdog = None;
        res
    }

    pub fn view(&self) -> Option<TimeoutView> {
        let handler = self.handler?;
        Some(TimeoutView {
            seconds: self.duration.map_or(0.0, |d| d.as_secs_f64()),
            call_site: self.call_site.clone()?,
            handler,
        })
    }
}
