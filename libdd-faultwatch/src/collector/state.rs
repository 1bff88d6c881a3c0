// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide state and the snapshot the crash handler reads.
//!
//! The state itself lives behind a `Mutex` that only the control API takes. Every mutation
//! publishes a fresh, immutable [`ConfigView`] through an atomic pointer so that the fault path
//! never needs a lock.

use super::alt_stack::AltStack;
use super::signal_handler_manager::SignalTable;
use super::stack_filter::StackFilter;
use super::symbolizer::ExecutableImage;
use super::timeout::{TimeoutState, TimeoutView};
use crate::shared::configuration::{FaultWatchConfiguration, PostAction};
use crate::shared::constants::MESSAGE_CAPACITY;
use crate::shared::fixed_buf::FixedBuf;
use crate::shared::rank::RankInfo;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use std::time::Duration;

pub type Message = FixedBuf<MESSAGE_CAPACITY>;

/// Everything the crash handler reads. Built under the state lock, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ConfigView {
    pub output_fd: RawFd,
    pub use_color: bool,
    pub post_action: PostAction,
    pub max_frames: usize,
    pub message: Message,
    pub filter: StackFilter,
    pub rank: RankInfo,
    pub signals: SignalTable,
    pub timeout: Option<TimeoutView>,
    pub exit_delay: Duration,
    /// Absolute path of the symbolizer, looked up when the state was created.
    pub symbolizer: Option<CString>,
    pub symbolizer_timeout: Duration,
    pub executable: ExecutableImage,
    pub suppress_silent_abort: bool,
}

/// The single process-wide debug context, created by `init` and torn down by `fini`.
#[derive(Debug)]
pub struct DebugState {
    pub config: FaultWatchConfiguration,
    pub rank: RankInfo,
    pub use_color: bool,
    pub message: Message,
    pub filter: StackFilter,
    pub signals: SignalTable,
    pub alt_stack: Option<AltStack>,
    pub timeout: TimeoutState,
    pub symbolizer: Option<CString>,
    pub executable: ExecutableImage,
}

impl DebugState {
    pub fn view(&self) -> ConfigView {
        ConfigView {
            output_fd: self.config.output_fd(),
            use_color: self.use_color,
            post_action: self.config.post_action(),
            max_frames: self.config.max_frames(),
            message: self.message,
            filter: self.filter.clone(),
            rank: self.rank,
            signals: self.signals,
            timeout: self.timeout.view(),
            exit_delay: self.config.exit_delay(),
            symbolizer: self.symbolizer.clone(),
            symbolizer_timeout: self.config.symbolizer_timeout(),
            executable: self.executable.clone(),
            suppress_silent_abort: self.config.suppress_silent_abort(),
        }
    }

    /// Makes the current state visible to the crash handler.
    pub fn publish(&self) {
        SNAPSHOT.publish(Some(self.view()));
    }
}

/// Atomically swapped pointer to the latest [`ConfigView`].
///
/// Reclamation: a writer frees the view it replaced only if no fault has started. The faulting
/// thread raises the flag before it loads the pointer, so with sequentially consistent ordering
/// any view it can observe is either current or leaked, never freed.
pub struct Snapshot {
    view: AtomicPtr<ConfigView>,
    fault_in_progress: AtomicBool,
}

pub static SNAPSHOT: Snapshot = Snapshot::new();

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    pub const fn new() -> Self {
        Self {
            view: AtomicPtr::new(ptr::null_mut()),
            fault_in_progress: AtomicBool::new(false),
        }
    }

    pub fn publish(&self, view: Option<ConfigView>) {
        let new = view.map_or(ptr::null_mut(), |v| Box::into_raw(Box::new(v)));
        let old = self.view.swap(new, SeqCst);
        if !old.is_null() && !self.fault_in_progress.load(SeqCst) {
            // SAFETY: `old` came from `Box::into_raw` and, with no fault in progress, nobody else
            // can hold a reference to it.
            drop(unsafe { Box::from_raw(old) });
        }
    }

    /// Called once from the fault path. Never allocates or frees.
    pub fn begin_fault(&self) -> Option<&ConfigView> {
        self.fault_in_progress.store(true, SeqCst);
        let view = self.view.load(SeqCst);
        // SAFETY: from here on published views are never freed.
        unsafe { view.as_ref() }
    }

    #[cfg(test)]
    pub fn is_published(&self) -> bool {
        !self.view.load(SeqCst).is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_view() -> ConfigView {
        ConfigView {
            output_fd: libc::STDERR_FILENO,
            use_color: false,
            post_action: PostAction::Exit,
            max_frames: 16,
            message: Message::new(),
            filter: StackFilter::new(),
            rank: RankInfo::SINGLE,
            signals: SignalTable::new(),
            timeout: None,
            exit_delay: Duration::ZERO,
            symbolizer: None,
            symbolizer_timeout: Duration::from_secs(1),
            executable: ExecutableImage::default(),
            suppress_silent_abort: false,
        }
    }

    #[test]
    fn test_publish_replaces_view() {
        let snapshot = Snapshot::new();
        assert!(!snapshot.is_published());
        snapshot.publish(Some(sample_view()));
        let mut second = sample_view();
        second.max_frames = 3;
        snapshot.publish(Some(second));
        assert!(snapshot.is_published());
        snapshot.publish(None);
        assert!(!snapshot.is_published());
    }

    #[test]
    fn test_view_survives_publish_during_fault() {
        let snapshot = Snapshot::new();
        let mut first = sample_view();
        first.message.set("before");
        snapshot.publish(Some(first));
        let seen = snapshot.begin_fault().unwrap();

        let mut second = sample_view();
        second.message.set("after");
        snapshot.publish(Some(second));
        // The replaced view is leaked, not freed.
        assert_eq!(seen.message.as_str(), "before");
    }

    #[test]
    fn test_begin_fault_without_view() {
        let snapshot = Snapshot::new();
        assert!(snapshot.begin_fault().is_none());
    }
}
