// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash diagnostics and execution deadlines for long-running, multi-process numerical codes.
//!
//! After [`init`], a fatal signal (or an expired [`set_timeout`] deadline) produces a short
//! report on the configured output, labeled with the process rank:
//!
//! ```text
//! [F::003 CRASH] -------------------------------
//! [F::003 CRASH] | Floating point exception (integer divide by zero)
//! [F::003 CRASH] | 0  /opt/app/solver(+0x1f2a) [0x55d0c0a01f2a] at solver.c:31 (divide)
//! [F::003 CRASH] | 1  /opt/app/solver(main+0x2c) [0x55d0c0a0204c] at solver.c:88 (main)
//! [F::003 CRASH] -------------------------------
//! ```
//!
//! and the process then exits with the signal number as its status (or re-raises, or freezes for
//! a debugger, see [`PostAction`]).
//!
//! The signal handler runs under the usual constraints: no allocation and no locks.
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! Everything it needs is published ahead of time as an immutable snapshot, and the first thing
//! it does is put back the handlers it replaced, so that a second fault, or a runtime that
//! already owned some of these signals, falls through to the previous behavior.
//!
//! Frames are symbolized by running `addr2line` on each address. That is the one blocking
//! operation on the fault path; it is bounded by a deadline and the child is killed when the
//! deadline passes.
#![cfg(unix)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod collector;
pub mod shared;
pub mod unix_utils;

pub use collector::*;
pub use shared::configuration::{FaultWatchConfiguration, PostAction};
pub use shared::rank::{EnvRankProvider, RankInfo, RankProvider, StaticRankProvider};
