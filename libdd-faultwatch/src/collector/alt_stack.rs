// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::{
    MAX_BACKTRACE_FRAMES, REPORT_CAPACITY, SMALL_BUF_COUNT, SMALL_BUF_SIZE, STACK_SLACK,
};
use libc::{c_void, mmap, munmap, sigaltstack, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE};
use libc::{PROT_READ, PROT_WRITE, SIGSTKSZ};
use nix::errno::Errno;
use std::ptr;
use std::thread::{self, ThreadId};

#[derive(Debug, thiserror::Error)]
pub enum AltStackError {
    #[error("failed to allocate an alternative stack: {0}")]
    Map(Errno),
    #[error("failed to set up alternative stack guard page: {0}")]
    Guard(Errno),
    #[error("sigaltstack failed: {0}")]
    Install(Errno),
    #[error("the alternative stack belongs to another thread")]
    WrongThread,
}

/// Usable size of the fault stack: room for the platform minimum plus everything the handler
/// keeps in locals while building a report.
pub fn alt_stack_size(page_size: usize) -> usize {
    let base = SIGSTKSZ.max(16 * page_size);
    let needed = base
        + MAX_BACKTRACE_FRAMES * std::mem::size_of::<usize>()
        + SMALL_BUF_COUNT * SMALL_BUF_SIZE
        + REPORT_CAPACITY
        + STACK_SLACK;
    needed.div_ceil(page_size) * page_size
}

/// A signal stack for the thread that installed it, with a guard page below it.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
pub struct AltStack {
    mapping: *mut c_void,
    mapping_len: usize,
    previous: libc::stack_t,
    owner: ThreadId,
}

// SAFETY: the mapping is only touched through the kernel once installed; the struct just
// remembers it so it can be released.
unsafe impl Send for AltStack {}

impl std::fmt::Debug for AltStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AltStack")
            .field("mapping", &self.mapping)
            .field("mapping_len", &self.mapping_len)
            .field("owner", &self.owner)
            .finish()
    }
}

impl AltStack {
    /// Maps the stack and installs it for the calling thread, remembering the previous one.
    pub fn create() -> Result<Self, AltStackError> {
        let page_size = page_size::get();
        let size = alt_stack_size(page_size);
        let mapping_len = size + page_size;
        // SAFETY: anonymous private mapping, no preconditions.
        let mapping = unsafe {
            mmap(
                ptr::null_mut(),
                mapping_len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if mapping == MAP_FAILED {
            return Err(AltStackError::Map(Errno::last()));
        }
        let unmap = |err| {
            // SAFETY: `mapping` came from the mmap above.
            unsafe { munmap(mapping, mapping_len) };
            err
        };
        // SAFETY: the first page of our own mapping.
        if unsafe { libc::mprotect(mapping, page_size, PROT_NONE) } != 0 {
            return Err(unmap(AltStackError::Guard(Errno::last())));
        }
        let stack = libc::stack_t {
            // SAFETY: stays inside the mapping.
            ss_sp: unsafe { mapping.cast::<u8>().add(page_size) }.cast(),
            ss_flags: 0,
            ss_size: size,
        };
        // SAFETY: all-zero is a valid `stack_t` for the kernel to overwrite.
        let mut previous: libc::stack_t = unsafe { std::mem::zeroed() };
        // SAFETY: both pointers reference live `stack_t` values.
        if unsafe { sigaltstack(&stack, &mut previous) } != 0 {
            return Err(unmap(AltStackError::Install(Errno::last())));
        }
        Ok(Self {
            mapping,
            mapping_len,
            previous,
            owner: thread::current().id(),
        })
    }

    pub fn size(&self) -> usize {
        self.mapping_len - page_size::get()
    }

    /// Puts back the previous signal stack and releases the mapping. On any other thread than the
    /// one that called [`AltStack::create`] the mapping is left in place, since the owner may still
    /// be using it.
    pub fn restore(self) -> Result<(), AltStackError> {
        if thread::current().id() != self.owner {
            return Err(AltStackError::WrongThread);
        }
        let mut previous = self.previous;
        if previous.ss_sp.is_null() || previous.ss_size == 0 {
            previous.ss_flags = libc::SS_DISABLE;
        }
        // SAFETY: `previous` is the value the kernel reported at creation time.
        let rc = unsafe { sigaltstack(&previous, ptr::null_mut()) };
        let res = if rc == 0 {
            Ok(())
        } else {
            Err(AltStackError::Install(Errno::last()))
        };
        if res.is_ok() {
            // SAFETY: nothing refers to the mapping any more.
            unsafe { munmap(self.mapping, self.mapping_len) };
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_covers_report_and_is_page_aligned() {
        for page in [4096usize, 16384, 65536] {
            let size = alt_stack_size(page);
            assert_eq!(size % page, 0);
            assert!(size >= REPORT_CAPACITY + STACK_SLACK + 16 * page);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_create_and_restore_on_fresh_thread() {
        std::thread::spawn(|| {
            let stack = AltStack::create().unwrap();
            let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
            unsafe { sigaltstack(ptr::null(), &mut current) };
            assert_eq!(current.ss_size, stack.size());
            stack.restore().unwrap();

            unsafe { sigaltstack(ptr::null(), &mut current) };
            assert_ne!(current.ss_size, alt_stack_size(page_size::get()));
        })
        .join()
        .unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_restore_from_other_thread_is_refused() {
        let stack = std::thread::spawn(AltStack::create).join().unwrap().unwrap();
        assert!(matches!(stack.restore(), Err(AltStackError::WrongThread)));
    }
}
