// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Async-signal-safe process plumbing: bounded child execution and reaping.

mod process;
mod subprocess;
mod timeout;

pub use process::{reap_before, reap_or_kill, terminate, ReapError};
pub use subprocess::{ForkExecRunner, RunError, RunOutput, SubprocessRunner, MAX_ARGS};
pub use timeout::Deadline;
