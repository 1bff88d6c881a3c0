// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::any::Any;
use std::ffi::{c_char, CStr};

/// Outcome of a `ddog_fw_*` call. Failures are logged through `tracing`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub enum FaultWatchStatus {
    Ok = 0,
    Err = 1,
}

impl From<anyhow::Result<()>> for FaultWatchStatus {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => FaultWatchStatus::Ok,
            Err(e) => {
                tracing::warn!("{e:#}");
                FaultWatchStatus::Err
            }
        }
    }
}

/// Wraps the body of a C entry point: converts the `anyhow` result into a status and turns a
/// panic into an error instead of unwinding across the FFI boundary.
/// Expects the function to be decorated with `#[named]`.
#[macro_export]
macro_rules! wrap_with_status {
    ($body:block) => {{
        use anyhow::Context;
        use std::panic::{catch_unwind, AssertUnwindSafe};

        catch_unwind(AssertUnwindSafe(|| {
            (|| {
                $body;
                anyhow::Ok(())
            })()
            .context(concat!(function_name!(), " failed"))
        }))
        .unwrap_or_else(|e| Err($crate::utils::panic_error(e, function_name!())))
        .into()
    }};
}

pub fn panic_error(error: Box<dyn Any + Send + 'static>, function_name: &str) -> anyhow::Error {
    if let Some(s) = error.downcast_ref::<String>() {
        anyhow::anyhow!("{function_name} failed: (panic) {s}")
    } else if let Some(s) = error.downcast_ref::<&str>() {
        anyhow::anyhow!("{function_name} failed: (panic) {s}")
    } else {
        anyhow::anyhow!("{function_name} failed: (panic) Unable to retrieve panic context")
    }
}

/// # Safety
/// `ptr` must be null or point to a nul-terminated string that stays valid for `'a`.
pub unsafe fn str_from_c<'a>(ptr: *const c_char) -> anyhow::Result<&'a str> {
    anyhow::ensure!(!ptr.is_null(), "null string");
    Ok(CStr::from_ptr(ptr).to_str()?)
}

/// Copies `text` into `buf` as a nul-terminated string, truncated to fit.
/// Returns the number of bytes copied, not counting the terminator.
///
/// # Safety
/// `buf` must be null or valid for writes of `len` bytes.
pub unsafe fn copy_to_c(text: &str, buf: *mut c_char, len: usize) -> usize {
    if buf.is_null() || len == 0 {
        return 0;
    }
    let mut n = text.len().min(len - 1);
    while !text.is_char_boundary(n) {
        n -= 1;
    }
    std::ptr::copy_nonoverlapping(text.as_ptr(), buf.cast::<u8>(), n);
    *buf.add(n) = 0;
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use function_name::named;

    #[test]
    fn test_copy_to_c_truncates_on_char_boundary() {
        let mut buf = [0x7f as c_char; 6];
        let n = unsafe { copy_to_c("héllo", buf.as_mut_ptr(), buf.len()) };
        assert_eq!(n, 5);
        let copied = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(copied.to_str().unwrap(), "héll");

        let n = unsafe { copy_to_c("héllo", buf.as_mut_ptr(), 3) };
        assert_eq!(n, 1);
        assert_eq!(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_bytes(), b"h");

        assert_eq!(unsafe { copy_to_c("x", std::ptr::null_mut(), 4) }, 0);
    }

    #[test]
    fn test_str_from_c() {
        let s = c"solver";
        assert_eq!(unsafe { str_from_c(s.as_ptr()) }.unwrap(), "solver");
        assert!(unsafe { str_from_c(std::ptr::null()) }.is_err());
    }

    #[named]
    fn fails() -> FaultWatchStatus {
        wrap_with_status!({
            anyhow::bail!("nope");
        })
    }

    #[named]
    fn panics() -> FaultWatchStatus {
        wrap_with_status!({
            let v: Vec<u8> = Vec::new();
            let _x: u8 = std::hint::black_box(&v)[1];
        })
    }

    #[named]
    fn succeeds() -> FaultWatchStatus {
        wrap_with_status!({})
    }

    #[test]
    fn test_wrap_with_status() {
        assert_eq!(succeeds(), FaultWatchStatus::Ok);
        assert_eq!(fails(), FaultWatchStatus::Err);
        assert_eq!(panics(), FaultWatchStatus::Err);
    }

    #[test]
    fn test_panic_error_message() {
        let e = panic_error(Box::new("boom"), "ddog_fw_test");
        assert_eq!(e.to_string(), "ddog_fw_test failed: (panic) boom");
    }
}
