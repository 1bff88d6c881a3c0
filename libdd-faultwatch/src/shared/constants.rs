// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Maximum number of signals the registry can intercept at once.
pub const MAX_INTERCEPTED_SIGNALS: usize = 64;

/// Upper bound on the number of frames a report can list.
pub const MAX_BACKTRACE_FRAMES: usize = 64;

/// Frames captured before the handler's own frames are stripped.
pub const CAPTURE_CAPACITY: usize = 2 * MAX_BACKTRACE_FRAMES;

/// Frames skipped past the handler entry when the interrupted instruction pointer cannot be found
/// in the captured stack: the handler itself and the kernel's signal trampoline.
pub const STRIP_DEPTH: usize = 2;

/// Capacity of the scratch buffers used while handling a fault (cause text, raw symbol text,
/// symbolizer output).
pub const SMALL_BUF_SIZE: usize = 256;
pub const SMALL_BUF_COUNT: usize = 3;

/// Capacity of the rendered crash report.
pub const REPORT_CAPACITY: usize = 64 * 1024;

/// Extra room on the alternate stack for the formatter's own frames.
pub const STACK_SLACK: usize = 128 * 1024;

/// Capacity of the user message, including the terminator.
pub const MESSAGE_CAPACITY: usize = 1024;

pub const DEFAULT_EXIT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_SYMBOLIZER: &str = "addr2line";
pub const DEFAULT_SYMBOLIZER_TIMEOUT: Duration = Duration::from_secs(2);

pub const UNRESOLVED_MARKER: &str = "??? (could not resolve)";

pub const REPORT_BORDER: &str = "-------------------------------";
