// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Wall-clock budget for one symbolizer run. Reading the clock is a `clock_gettime` call, so a
/// deadline can be checked from inside the crash handler.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        Self {
            expires_at: now.checked_add(budget).unwrap_or(now),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn passed(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Remaining time for `poll(2)`, in whole milliseconds rounded up so a partial millisecond
    /// still blocks.
    pub fn poll_timeout_ms(&self) -> libc::c_int {
        let micros = self.remaining().as_micros();
        let ms = micros.div_ceil(1000);
        libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
    }
}
