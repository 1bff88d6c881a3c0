// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::{CAPTURE_CAPACITY, STRIP_DEPTH};

/// Return addresses captured while handling a fault. Lives on the (alternate) stack; never
/// allocates.
#[derive(Clone, Copy)]
pub struct CapturedFrames {
    ips: [usize; CAPTURE_CAPACITY],
    symbols: [usize; CAPTURE_CAPACITY],
    len: usize,
}

impl Default for CapturedFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturedFrames {
    pub const fn new() -> Self {
        Self {
            ips: [0; CAPTURE_CAPACITY],
            symbols: [0; CAPTURE_CAPACITY],
            len: 0,
        }
    }

    /// Appends a frame. Returns false once the capture is full.
    pub fn push(&mut self, ip: usize, symbol_address: usize) -> bool {
        if self.len == CAPTURE_CAPACITY {
            return false;
        }
        self.ips[self.len] = ip;
        self.symbols[self.len] = symbol_address;
        self.len += 1;
        self.len < CAPTURE_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ips(&self) -> &[usize] {
        &self.ips[..self.len]
    }

    pub fn symbol_addresses(&self) -> &[usize] {
        &self.symbols[..self.len]
    }

    /// Index of the frame right after the one running `entry`, or 0 if it was not captured.
    pub fn after(&self, entry: usize) -> usize {
        self.symbol_addresses()
            .iter()
            .position(|symbol| entry != 0 && *symbol == entry)
            .map_or(0, |index| index + 1)
    }

    /// Index of the first frame that belongs to the interrupted program rather than to the
    /// handler or the unwinder.
    ///
    /// The interrupted instruction pointer is looked for first. Failing that, `STRIP_DEPTH`
    /// frames are skipped starting at the handler's entry frame (the entry itself and the signal
    /// trampoline), or from the top if the entry frame is not found either.
    pub fn first_reported(&self, interrupted_ip: Option<usize>, handler_entry: usize) -> usize {
        if let Some(ip) = interrupted_ip.filter(|ip| *ip != 0) {
            if let Some(index) = self.ips().iter().position(|candidate| *candidate == ip) {
                return index;
            }
        }
        let entry = self
            .symbol_addresses()
            .iter()
            .position(|symbol| handler_entry != 0 && *symbol == handler_entry);
        let start = match entry {
            Some(index) => index + STRIP_DEPTH,
            None => STRIP_DEPTH,
        };
        start.min(self.len)
    }
}

/// Walks the current thread's stack with the platform unwinder.
///
/// # Safety
/// Uses the unsynchronized unwinder entry point: no other thread may be unwinding through the
/// `backtrace` crate at the same time. Only ever called once per process, from the fault path.
#[inline(never)]
pub unsafe fn capture(frames: &mut CapturedFrames) {
    backtrace::trace_unsynchronized(|frame| {
        frames.push(frame.ip() as usize, frame.symbol_address() as usize)
    });
}
