// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Platform capabilities.
//!
//! Everything that differs between targets is decided here so the crash handler itself stays
//! platform-neutral.

use libc::{c_void, siginfo_t, ucontext_t};

/// Signal used to deliver an expired deadline. Linux has a realtime range that nobody else is
/// likely to use; macOS has none, so a user-defined signal stands in.
pub fn timeout_signal() -> i32 {
    #[cfg(target_os = "linux")]
    {
        libc::SIGRTMIN() + 1
    }
    #[cfg(not(target_os = "linux"))]
    {
        libc::SIGUSR2
    }
}

/// Whether handlers should run on the alternate fault stack.
/// The macOS unwinder cannot walk from a handler running on an alternate stack back into the
/// interrupted frames, so there the handler stays on the thread's normal stack.
pub const fn uses_alt_stack() -> bool {
    !cfg!(target_os = "macos")
}

/// Address of the faulting data access, if the signal carries one.
///
/// # Safety
/// `sig_info` must be null or point to the `siginfo_t` passed to a `SA_SIGINFO` handler.
pub unsafe fn fault_address(sig_info: *const siginfo_t) -> usize {
    if sig_info.is_null() {
        return 0;
    }
    #[cfg(target_os = "linux")]
    {
        (*sig_info).si_addr() as usize
    }
    #[cfg(not(target_os = "linux"))]
    {
        (*sig_info).si_addr as usize
    }
}

/// Instruction pointer of the interrupted code, taken from the signal context.
///
/// # Safety
/// `ucontext` must be null or point to the context passed to a `SA_SIGINFO` handler.
pub unsafe fn interrupted_ip(ucontext: *const c_void) -> Option<usize> {
    let ucontext = ucontext as *const ucontext_t;
    if ucontext.is_null() {
        return None;
    }
    Some(ip_from_context(&*ucontext))
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn ip_from_context(ucontext: &ucontext_t) -> usize {
    (*ucontext.uc_mcontext).__ss.__rip as usize
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn ip_from_context(ucontext: &ucontext_t) -> usize {
    (*ucontext.uc_mcontext).__ss.__pc as usize
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn ip_from_context(ucontext: &ucontext_t) -> usize {
    ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn ip_from_context(ucontext: &ucontext_t) -> usize {
    ucontext.uc_mcontext.pc as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_timeout_signal_is_realtime() {
        let sig = timeout_signal();
        assert!(sig > libc::SIGRTMIN() && sig <= libc::SIGRTMAX());
    }

    #[test]
    fn test_null_contexts() {
        unsafe {
            assert_eq!(fault_address(std::ptr::null()), 0);
            assert_eq!(interrupted_ip(std::ptr::null()), None);
        }
    }
}
