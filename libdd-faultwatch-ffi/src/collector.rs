// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::utils::{copy_to_c, str_from_c, FaultWatchStatus};
use crate::wrap_with_status;
use function_name::named;
use libdd_faultwatch::{CallSite, DeregisterStatus, RegisterStatus};
use std::ffi::{c_char, c_int, c_void};

pub use libdd_faultwatch::PostAction;

/// Call sites that come from C have no `'static` file name; the name is copied.
unsafe fn call_site(file: *const c_char, line: u32) -> CallSite {
    let file = str_from_c(file).unwrap_or("<unknown>");
    CallSite::new(file.to_owned(), line)
}

#[no_mangle]
#[named]
/// Installs the crash handlers, configured from the `DD_FAULTWATCH_*` environment variables.
/// Labels reports with the rank found in the launcher environment.
///
/// # Preconditions
///   None. Calling it again after a successful init has no effect.
/// # Safety
///   No other faultwatch function should be called concurrently.
/// # Atomicity
///   Setup failures terminate the process with a diagnostic on stderr.
pub unsafe extern "C" fn ddog_fw_init() -> FaultWatchStatus {
    wrap_with_status!({
        libdd_faultwatch::init();
    })
}

#[no_mangle]
#[named]
/// Restores every replaced handler and releases the alternate stack and the watchdog.
/// Must be called from the thread that called `ddog_fw_init` for the alternate stack to be
/// released.
///
/// # Safety
///   No other faultwatch function should be called concurrently.
pub unsafe extern "C" fn ddog_fw_fini() -> FaultWatchStatus {
    wrap_with_status!({
        libdd_faultwatch::fini();
    })
}

#[no_mangle]
#[named]
/// Adds `signum` to the intercepted signals. Registering an already intercepted signal succeeds.
/// Fails for invalid signal numbers, when the table is full, or before `ddog_fw_init`.
///
/// # Safety
///   None.
pub unsafe extern "C" fn ddog_fw_register_signal(signum: c_int) -> FaultWatchStatus {
    wrap_with_status!({
        match libdd_faultwatch::register_additional_signal(signum)? {
            RegisterStatus::Registered | RegisterStatus::AlreadyRegistered => {}
            status => anyhow::bail!("signal {signum} was not registered: {status:?}"),
        }
    })
}

#[no_mangle]
#[named]
/// Stops intercepting `signum` and restores the handler it had before. Deregistering a signal
/// that is not intercepted succeeds.
///
/// # Safety
///   None.
pub unsafe extern "C" fn ddog_fw_deregister_signal(signum: c_int) -> FaultWatchStatus {
    wrap_with_status!({
        match libdd_faultwatch::deregister_signal(signum)? {
            DeregisterStatus::Restored | DeregisterStatus::NotRegistered => {}
            DeregisterStatus::NotInitialized => anyhow::bail!("not initialized"),
        }
    })
}

#[no_mangle]
/// Copies the current message into `buf` as a nul-terminated string, truncated to `len - 1`
/// bytes. Returns the number of bytes copied, not counting the terminator.
///
/// # Safety
///   `buf` must be null or valid for writes of `len` bytes.
pub unsafe extern "C" fn ddog_fw_get_message(buf: *mut c_char, len: usize) -> usize {
    copy_to_c(&libdd_faultwatch::get_message(), buf, len)
}

#[no_mangle]
/// Sets the line printed under the cause in a report. A null `message` clears it.
/// Returns false if the message was truncated, is not UTF-8, or before `ddog_fw_init`.
///
/// # Safety
///   `message` must be null or a valid nul-terminated string.
pub unsafe extern "C" fn ddog_fw_set_message(message: *const c_char) -> bool {
    if message.is_null() {
        libdd_faultwatch::clear_message();
        return true;
    }
    match str_from_c(message) {
        Ok(message) => libdd_faultwatch::set_message(message),
        Err(_) => false,
    }
}

#[no_mangle]
/// # Safety
///   None.
pub unsafe extern "C" fn ddog_fw_clear_message() {
    libdd_faultwatch::clear_message()
}

#[no_mangle]
#[named]
/// Limits the number of frames listed in a report. Must be between 1 and 64.
///
/// # Safety
///   None.
pub unsafe extern "C" fn ddog_fw_set_max_frames(max_frames: usize) -> FaultWatchStatus {
    wrap_with_status!({
        libdd_faultwatch::set_max_frames(max_frames)?;
    })
}

#[no_mangle]
/// # Safety
///   None.
pub unsafe extern "C" fn ddog_fw_get_max_frames() -> usize {
    libdd_faultwatch::get_max_frames()
}

#[no_mangle]
#[named]
/// Hides frames whose raw or resolved text contains `pattern`.
///
/// # Safety
///   `pattern` must be a valid nul-terminated string.
pub unsafe extern "C" fn ddog_fw_add_stack_filter(pattern: *const c_char) -> FaultWatchStatus {
    wrap_with_status!({
        libdd_faultwatch::add_stack_filter(str_from_c(pattern)?);
    })
}

#[no_mangle]
/// Removes one copy of `pattern`. Returns false if it was not present.
///
/// # Safety
///   `pattern` must be null or a valid nul-terminated string.
pub unsafe extern "C" fn ddog_fw_remove_stack_filter(pattern: *const c_char) -> bool {
    str_from_c(pattern).is_ok_and(libdd_faultwatch::remove_stack_filter)
}

#[no_mangle]
/// Arms a deadline `seconds` from now. `file` and `line` name the caller in the report; a null
/// `file` is shown as `<unknown>`.
/// Terminates the process before `ddog_fw_init` or for a negative or non-finite duration.
///
/// # Safety
///   `file` must be null or a valid nul-terminated string.
pub unsafe extern "C" fn ddog_fw_set_timeout(seconds: f64, file: *const c_char, line: u32) {
    libdd_faultwatch::set_timeout_at(seconds, call_site(file, line))
}

#[no_mangle]
/// Disarms the deadline, if any.
/// Terminates the process before `ddog_fw_init`.
///
/// # Safety
///   None.
pub unsafe extern "C" fn ddog_fw_clear_timeout() {
    libdd_faultwatch::clear_timeout()
}

#[no_mangle]
/// Re-arms the deadline with the last duration given to `ddog_fw_set_timeout`.
/// Terminates the process before `ddog_fw_init` or if no timeout was ever set.
///
/// # Safety
///   `file` must be null or a valid nul-terminated string.
pub unsafe extern "C" fn ddog_fw_restart_timeout(file: *const c_char, line: u32) {
    libdd_faultwatch::restart_timeout_at(call_site(file, line))
}

#[no_mangle]
/// # Safety
///   None.
pub unsafe extern "C" fn ddog_fw_set_post_action(post_action: PostAction) {
    libdd_faultwatch::set_post_action(post_action)
}

/// Capacity of the texts in [`FaultWatchFrame`], terminator included.
pub const FRAME_TEXT_LEN: usize = 128;

/// One stack frame, as filled in by [`ddog_fw_backtrace`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FaultWatchFrame {
    pub pc: *const c_void,
    /// Start of the function `pc` belongs to.
    pub function: *const c_void,
    /// `module(symbol+0xoff) [0xaddr]`
    pub symbol: [c_char; FRAME_TEXT_LEN],
    /// `file:line (function)`, empty if the frame could not be symbolized.
    pub source: [c_char; FRAME_TEXT_LEN],
}

#[no_mangle]
/// Captures and symbolizes the calling thread's stack into `buffer`, innermost frame first,
/// starting at this call. Texts are nul-terminated and truncated to fit.
/// Returns the number of frames written, at most `max_depth`.
///
/// Not for use from a signal handler: frames are symbolized by running `addr2line`.
///
/// # Safety
///   `buffer` must be null or valid for writes of `max_depth` frames.
pub unsafe extern "C" fn ddog_fw_backtrace(buffer: *mut FaultWatchFrame, max_depth: usize) -> usize {
    if buffer.is_null() {
        return 0;
    }
    let frames = libdd_faultwatch::capture_backtrace(max_depth);
    for (index, frame) in frames.iter().enumerate() {
        let mut out = FaultWatchFrame {
            pc: frame.ip as *const c_void,
            function: frame.function as *const c_void,
            symbol: [0; FRAME_TEXT_LEN],
            source: [0; FRAME_TEXT_LEN],
        };
        copy_to_c(&frame.symbol, out.symbol.as_mut_ptr(), FRAME_TEXT_LEN);
        if let Some(source) = &frame.source {
            copy_to_c(source, out.source.as_mut_ptr(), FRAME_TEXT_LEN);
        }
        buffer.add(index).write(out);
    }
    frames.len()
}

#[no_mangle]
/// True once the active deadline has expired.
///
/// # Safety
///   None.
pub unsafe extern "C" fn ddog_fw_timeout_reached() -> bool {
    libdd_faultwatch::timeout_reached()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    // Everything here shares the process-wide state, so it runs as a single test.
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_entry_points() {
        unsafe {
            // Before init.
            assert_eq!(ddog_fw_register_signal(libc::SIGUSR1), FaultWatchStatus::Err);
            assert!(!ddog_fw_set_message(c"early".as_ptr()));

            std::env::set_var("DD_FAULTWATCH_ADDR2LINE", "none");
            assert_eq!(ddog_fw_init(), FaultWatchStatus::Ok);

            assert!(ddog_fw_set_message(c"iteration 12".as_ptr()));
            let mut buf = [0 as c_char; 64];
            assert_eq!(ddog_fw_get_message(buf.as_mut_ptr(), buf.len()), 12);
            assert_eq!(
                CStr::from_ptr(buf.as_ptr()).to_str().unwrap(),
                "iteration 12"
            );
            assert!(ddog_fw_set_message(std::ptr::null()));
            assert_eq!(ddog_fw_get_message(buf.as_mut_ptr(), buf.len()), 0);

            assert_eq!(ddog_fw_register_signal(libc::SIGUSR1), FaultWatchStatus::Ok);
            assert_eq!(ddog_fw_register_signal(libc::SIGUSR1), FaultWatchStatus::Ok);
            assert_eq!(ddog_fw_register_signal(-4), FaultWatchStatus::Err);
            // Owned by the timeout watchdog.
            assert_eq!(
                ddog_fw_register_signal(libdd_faultwatch::timeout_signal()),
                FaultWatchStatus::Err
            );
            assert_eq!(ddog_fw_deregister_signal(libc::SIGUSR1), FaultWatchStatus::Ok);
            assert_eq!(ddog_fw_deregister_signal(libc::SIGUSR1), FaultWatchStatus::Ok);

            assert_eq!(ddog_fw_set_max_frames(0), FaultWatchStatus::Err);
            assert_eq!(ddog_fw_set_max_frames(12), FaultWatchStatus::Ok);
            assert_eq!(ddog_fw_get_max_frames(), 12);

            assert_eq!(ddog_fw_add_stack_filter(c"mpi_".as_ptr()), FaultWatchStatus::Ok);
            assert_eq!(
                ddog_fw_add_stack_filter(std::ptr::null()),
                FaultWatchStatus::Err
            );
            assert!(ddog_fw_remove_stack_filter(c"mpi_".as_ptr()));
            assert!(!ddog_fw_remove_stack_filter(c"mpi_".as_ptr()));

            ddog_fw_set_post_action(PostAction::Raise);
            assert_eq!(libdd_faultwatch::get_post_action(), PostAction::Raise);

            ddog_fw_set_timeout(30.0, c"solver.c".as_ptr(), 88);
            ddog_fw_restart_timeout(std::ptr::null(), 90);
            ddog_fw_clear_timeout();
            assert!(!ddog_fw_timeout_reached());

            assert_eq!(ddog_fw_fini(), FaultWatchStatus::Ok);
            assert_eq!(ddog_fw_fini(), FaultWatchStatus::Ok);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_backtrace_into_c_buffer() {
        let empty = FaultWatchFrame {
            pc: std::ptr::null(),
            function: std::ptr::null(),
            symbol: [0x7f; FRAME_TEXT_LEN],
            source: [0x7f; FRAME_TEXT_LEN],
        };
        let mut frames = [empty; 8];
        let written = unsafe { ddog_fw_backtrace(frames.as_mut_ptr(), 4) };
        assert!((1..=4).contains(&written));
        for frame in &frames[..written] {
            assert!(!frame.pc.is_null());
            let symbol = unsafe { CStr::from_ptr(frame.symbol.as_ptr()) };
            assert!(!symbol.is_empty());
            assert!(frame.source.contains(&0));
        }
        // Entries past the returned count are untouched.
        assert!(frames[written..].iter().all(|f| f.pc.is_null()));
        assert_eq!(unsafe { ddog_fw_backtrace(std::ptr::null_mut(), 4) }, 0);
        assert_eq!(unsafe { ddog_fw_backtrace(frames.as_mut_ptr(), 0) }, 0);
    }

    #[test]
    fn test_call_site_from_c() {
        let site = unsafe { call_site(c"solver.c".as_ptr(), 31) };
        assert_eq!(site.to_string(), "solver.c:31");
        let site = unsafe { call_site(std::ptr::null(), 7) };
        assert_eq!(site.to_string(), "<unknown>:7");
    }
}
