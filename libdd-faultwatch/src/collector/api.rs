// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::alt_stack::AltStack;
use super::platform::{timeout_signal, uses_alt_stack};
use super::signal_handler_manager::{
    DeregisterStatus, RegisterStatus, SignalRegistryError, SignalTable,
};
use super::stack_filter::StackFilter;
use super::state::{DebugState, Message, SNAPSHOT};
use super::symbolizer::{find_program, ExecutableImage};
use super::timeout::{CallSite, TimeoutError, TimeoutState, TIMEOUT_REACHED};
use crate::shared::configuration::{FaultWatchConfiguration, PostAction};
use crate::shared::rank::{EnvRankProvider, RankProvider};
use crate::unix_utils::terminate;
use std::ffi::CString;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

static STATE: Mutex<Option<DebugState>> = Mutex::new(None);

fn lock_state() -> MutexGuard<'static, Option<DebugState>> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` on the state and republishes the snapshot. Does nothing before `init`.
fn update<T>(f: impl FnOnce(&mut DebugState) -> T) -> Option<T> {
    let mut guard = lock_state();
    let state = guard.as_mut()?;
    let res = f(state);
    state.publish();
    Some(res)
}

fn read<T>(f: impl FnOnce(&DebugState) -> T) -> Option<T> {
    lock_state().as_ref().map(f)
}

/// How on-demand traces are symbolized.
pub(crate) struct SymbolizerSettings {
    pub program: Option<CString>,
    pub timeout: Duration,
    pub executable: ExecutableImage,
}

/// The settings crash reports use after `init`; before it, those of the environment.
pub(crate) fn symbolizer_settings() -> SymbolizerSettings {
    read(|state| SymbolizerSettings {
        program: state.symbolizer.clone(),
        timeout: state.config.symbolizer_timeout(),
        executable: state.executable.clone(),
    })
    .unwrap_or_else(|| {
        let config = FaultWatchConfiguration::from_env().unwrap_or_default();
        SymbolizerSettings {
            program: config.symbolizer().and_then(find_program),
            timeout: config.symbolizer_timeout(),
            executable: ExecutableImage::current(),
        }
    })
}

/// Setup could not be completed. Continuing would leave the process half-instrumented, so it
/// stops here.
fn fatal_setup_error(context: &str, err: impl fmt::Display) -> ! {
    tracing::error!(%err, "{context}");
    eprintln!("faultwatch: {context}: {err}");
    terminate()
}

fn is_tty(fd: RawFd) -> bool {
    // SAFETY: isatty accepts any descriptor.
    unsafe { libc::isatty(fd) == 1 }
}

fn build_state(
    config: FaultWatchConfiguration,
    rank_provider: &dyn RankProvider,
) -> anyhow::Result<DebugState> {
    let on_alt_stack = config.use_alt_stack() && uses_alt_stack();
    let alt_stack = if config.create_alt_stack() && uses_alt_stack() {
        Some(AltStack::create()?)
    } else {
        None
    };

    let symbolizer = config.symbolizer().and_then(|name| {
        let found = find_program(name);
        if found.is_none() {
            tracing::warn!(
                symbolizer = name,
                "Symbolizer not found, frames will not be resolved"
            );
        }
        found
    });

    let mut signals = SignalTable::new();
    for signum in config.signals() {
        if *signum == timeout_signal() {
            tracing::warn!(signum, "Not intercepting the signal reserved for timeouts");
            continue;
        }
        match signals.register(*signum, on_alt_stack) {
            Ok(RegisterStatus::TableFull) => {
                tracing::warn!(signum, "Intercepted signal table is full");
            }
            Ok(_) => {}
            Err(e) => {
                signals.revert_all(config.output_fd());
                if let Some(stack) = alt_stack {
                    let _ = stack.restore();
                }
                return Err(e.into());
            }
        }
    }

    Ok(DebugState {
        rank: rank_provider.current(),
        use_color: config
            .use_color()
            .unwrap_or_else(|| is_tty(config.output_fd())),
        message: Message::new(),
        filter: StackFilter::new(),
        signals,
        alt_stack,
        timeout: TimeoutState::new(timeout_signal(), on_alt_stack),
        symbolizer,
        executable: ExecutableImage::current(),
        config,
    })
}

/// Installs the crash handlers, configured from the environment.
/// Idempotent; setup failures terminate the process with a diagnostic.
pub fn init() {
    match FaultWatchConfiguration::from_env() {
        Ok(config) => init_with(config),
        Err(e) => fatal_setup_error("invalid configuration", e),
    }
}

/// Like [`init`], with an explicit configuration.
pub fn init_with(config: FaultWatchConfiguration) {
    init_with_rank_provider(config, &EnvRankProvider)
}

/// Like [`init_with`], for hosts that know their rank through other means than the launcher
/// environment.
pub fn init_with_rank_provider(config: FaultWatchConfiguration, rank_provider: &dyn RankProvider) {
    let mut guard = lock_state();
    if guard.is_some() {
        tracing::debug!("Already initialized");
        return;
    }
    match build_state(config, rank_provider) {
        Ok(state) => {
            state.publish();
            tracing::info!(
                rank = state.rank.rank,
                size = state.rank.size,
                signals = ?state.signals.signums().collect::<Vec<_>>(),
                timeout_signal = state.timeout.signal(),
                "Fault handlers installed"
            );
            *guard = Some(state);
        }
        Err(e) => fatal_setup_error("unable to install fault handlers", e),
    }
}

/// Restores every handler and releases all resources. Idempotent.
/// The alternate stack can only be released from the thread that called `init`.
pub fn fini() {
    let mut guard = lock_state();
    let Some(mut state) = guard.take() else {
        return;
    };
    SNAPSHOT.publish(None);
    if !state.signals.is_empty() {
        tracing::debug!(count = state.signals.len(), "Restoring intercepted signals");
    }
    state.signals.revert_all(state.config.output_fd());
    if state.timeout.is_armed() {
        tracing::debug!("Disarming the pending timeout");
    }
    if let Err(e) = state.timeout.shutdown() {
        tracing::warn!(%e, "Unable to clear the timeout");
    }
    if let Some(stack) = state.alt_stack.take() {
        if let Err(e) = stack.restore() {
            tracing::warn!(%e, "Leaving the alternative stack in place");
        }
    }
    TIMEOUT_REACHED.store(false, SeqCst);
    tracing::info!("Fault handlers removed");
}

pub fn is_initialized() -> bool {
    lock_state().is_some()
}

fn register_result<T>(res: Result<T, SignalRegistryError>) -> Result<T, SignalRegistryError> {
    match res {
        Err(e @ SignalRegistryError::InvalidSignal(_)) => Err(e),
        Err(e) => fatal_setup_error("unable to change signal handlers", e),
        ok => ok,
    }
}

/// Adds `signum` to the intercepted set. The timeout signal is owned by the watchdog and is
/// reported as [`RegisterStatus::Reserved`].
pub fn register_additional_signal(signum: i32) -> Result<RegisterStatus, SignalRegistryError> {
    update(|state| {
        if signum == state.timeout.signal() {
            return Ok(RegisterStatus::Reserved);
        }
        let on_alt_stack = state.config.use_alt_stack() && uses_alt_stack();
        register_result(state.signals.register(signum, on_alt_stack))
    })
    .unwrap_or(Ok(RegisterStatus::NotInitialized))
}

/// Stops intercepting `signum`, restoring the handler that was there before.
pub fn deregister_signal(signum: i32) -> Result<DeregisterStatus, SignalRegistryError> {
    update(|state| register_result(state.signals.deregister(signum)))
        .unwrap_or(Ok(DeregisterStatus::NotInitialized))
}

pub fn get_message() -> String {
    read(|state| state.message.as_str().to_owned()).unwrap_or_default()
}

/// Sets the line printed under the cause in the report. Returns false if it had to be
/// truncated (or before `init`).
pub fn set_message(message: &str) -> bool {
    update(|state| state.message.set(message)).unwrap_or(false)
}

/// Formatted variant of [`set_message`], e.g. `set_message_fmt(format_args!("step {n}"))`.
pub fn set_message_fmt(args: fmt::Arguments<'_>) -> bool {
    update(|state| {
        state.message.clear();
        let _ = fmt::Write::write_fmt(&mut state.message, args);
        !state.message.is_truncated()
    })
    .unwrap_or(false)
}

pub fn clear_message() {
    update(|state| state.message.clear());
}

pub fn set_max_frames(max_frames: usize) -> anyhow::Result<()> {
    update(|state| state.config.set_max_frames(max_frames)).unwrap_or(Ok(()))
}

pub fn get_max_frames() -> usize {
    read(|state| state.config.max_frames())
        .unwrap_or_else(|| FaultWatchConfiguration::default().max_frames())
}

/// Hides frames whose raw or resolved text contains `pattern`.
pub fn add_stack_filter(pattern: &str) {
    update(|state| state.filter.add(pattern));
}

/// Removes one copy of `pattern`. Returns false if it was not present.
pub fn remove_stack_filter(pattern: &str) -> bool {
    update(|state| state.filter.remove(pattern)).unwrap_or(false)
}

pub fn set_post_action(post_action: PostAction) {
    update(|state| state.config.set_post_action(post_action));
}

pub fn get_post_action() -> PostAction {
    read(|state| state.config.post_action()).unwrap_or_default()
}

pub fn set_output_fd(output_fd: RawFd) -> anyhow::Result<()> {
    update(|state| state.config.set_output_fd(output_fd)).unwrap_or(Ok(()))
}

pub fn set_use_color(use_color: bool) {
    update(|state| state.use_color = use_color);
}

/// Whether the active deadline has expired.
pub fn timeout_reached() -> bool {
    TIMEOUT_REACHED.load(SeqCst)
}

/// Timeout operations are fatal before `init` and on misuse.
fn with_timeout(op: impl FnOnce(&mut TimeoutState) -> Result<(), TimeoutError>) {
    let res = update(|state| op(&mut state.timeout)).unwrap_or(Err(TimeoutError::NotInitialized));
    if let Err(e) = res {
        fatal_setup_error("timeout", e)
    }
}

/// Arms a deadline `seconds` from now. When it expires a report is produced like for any other
/// fault, naming the caller's location.
#[track_caller]
pub fn set_timeout(seconds: f64) {
    set_timeout_at(seconds, CallSite::caller())
}

pub fn set_timeout_at(seconds: f64, call_site: CallSite) {
    with_timeout(|timeout| timeout.set(seconds, call_site))
}

/// Disarms the deadline, if any, and restores the previous handler of the timeout signal.
pub fn clear_timeout() {
    with_timeout(TimeoutState::clear)
}

/// Re-arms the deadline with the last duration given to [`set_timeout`].
#[track_caller]
pub fn restart_timeout() {
    restart_timeout_at(CallSite::caller())
}

pub fn restart_timeout_at(call_site: CallSite) {
    with_timeout(|timeout| timeout.restart(call_site))
}
