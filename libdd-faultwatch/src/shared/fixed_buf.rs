// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity text buffers.
//!
//! These are the only text sinks reachable while a fault is being handled. They never allocate:
//! writes past the capacity are truncated (on a UTF-8 boundary) and one byte is always reserved
//! for a NUL terminator, so the contents can be handed to C as-is.

use std::ffi::CStr;
use std::fmt;

#[derive(Clone, Copy)]
pub struct FixedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    /// Number of bytes that can be stored, not counting the terminator.
    pub const fn capacity() -> usize {
        N.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if some write did not fit.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
        if N > 0 {
            self.buf[0] = 0;
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole `str`s or char-boundary prefixes of them are ever copied in; raw bytes go
        // through `push_bytes`, which stops at the first invalid sequence.
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                let valid = e.valid_up_to();
                // SAFETY: `valid_up_to` delimits a valid UTF-8 prefix.
                unsafe { std::str::from_utf8_unchecked(&self.buf[..valid]) }
            }
        }
    }

    /// Contents with their NUL terminator.
    pub fn as_c_str(&self) -> &CStr {
        if N == 0 {
            return c"";
        }
        // Interior NULs end the string early, which is what C would see too.
        CStr::from_bytes_until_nul(&self.buf[..=self.len]).unwrap_or(c"")
    }

    /// Appends as much of `s` as fits. Returns false if anything was dropped.
    pub fn push_str(&mut self, s: &str) -> bool {
        let room = Self::capacity() - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.append(&s.as_bytes()[..take]);
        if take < s.len() {
            self.truncated = true;
            return false;
        }
        true
    }

    /// Appends raw bytes, e.g. the output of a subprocess. Stops at the first NUL or invalid
    /// UTF-8 sequence.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> bool {
        let bytes = match bytes.iter().position(|b| *b == 0) {
            Some(end) => &bytes[..end],
            None => bytes,
        };
        match std::str::from_utf8(bytes) {
            Ok(s) => self.push_str(s),
            Err(e) => {
                let valid = e.valid_up_to();
                // SAFETY: `valid_up_to` delimits a valid UTF-8 prefix.
                self.push_str(unsafe { std::str::from_utf8_unchecked(&bytes[..valid]) });
                self.truncated = true;
                false
            }
        }
    }

    pub fn set(&mut self, s: &str) -> bool {
        self.clear();
        self.push_str(s)
    }

    fn append(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        if end < N {
            self.buf[end] = 0;
        }
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    /// Never fails: formatting must not abort half way through a report line, so overflow is
    /// recorded in [`FixedBuf::is_truncated`] instead.
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for FixedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for FixedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> PartialEq for FixedBuf<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl<const N: usize> Eq for FixedBuf<N> {}

#[cfg(test)]
mod tests {
    use super::FixedBuf;
    use std::fmt::Write;

    #[test]
    fn test_push_within_capacity() {
        let mut buf = FixedBuf::<16>::new();
        assert!(buf.push_str("hello"));
        write!(buf, " {}", 42).unwrap();
        assert_eq!(buf.as_str(), "hello 42");
        assert_eq!(buf.as_c_str().to_bytes(), b"hello 42");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn test_truncates_to_capacity_minus_terminator() {
        let mut buf = FixedBuf::<8>::new();
        assert!(!buf.push_str("0123456789"));
        assert_eq!(buf.as_str(), "0123456");
        assert_eq!(buf.len(), FixedBuf::<8>::capacity());
        assert!(buf.is_truncated());
        // Further writes are dropped, never overflowed.
        write!(buf, "abc").unwrap();
        assert_eq!(buf.as_str(), "0123456");
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut buf = FixedBuf::<5>::new();
        buf.push_str("aé€");
        // 'a' (1) + 'é' (2) fit in 4 bytes, '€' (3) does not.
        assert_eq!(buf.as_str(), "aé");
    }

    #[test]
    fn test_push_bytes_stops_at_nul_and_invalid_utf8() {
        let mut buf = FixedBuf::<32>::new();
        buf.push_bytes(b"main.rs:12\0garbage");
        assert_eq!(buf.as_str(), "main.rs:12");

        let mut buf = FixedBuf::<32>::new();
        assert!(!buf.push_bytes(b"ok\xffrest"));
        assert_eq!(buf.as_str(), "ok");
    }

    #[test]
    fn test_set_and_clear() {
        let mut buf = FixedBuf::<32>::new();
        buf.set("first");
        buf.set("second");
        assert_eq!(buf.as_str(), "second");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.as_c_str().to_bytes(), b"");
    }
}
