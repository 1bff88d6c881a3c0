// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Renders crash reports into a fixed-capacity buffer.
//!
//! ```text
//! [F::000 CRASH] -------------------------------
//! [F::000 CRASH] | Floating point exception (integer divide by zero)
//! [F::000 CRASH] | optional user message
//! [F::000 CRASH] | 0  probe(+0x1f2a) [0x55d0c0a01f2a] at probe.rs:31 (divide)
//! [F::000 CRASH] | (Filtered 1 frames)
//! [F::000 CRASH] -------------------------------
//! ```

use crate::shared::constants::REPORT_BORDER;
use crate::shared::fixed_buf::FixedBuf;
use crate::shared::rank::{decimal_digits, RankInfo};
use std::fmt::Write;
use std::os::fd::RawFd;

const RED: &str = "\x1b[31m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Line-oriented writer for one crash report. Never allocates; output past the buffer's
/// capacity is dropped.
pub(crate) struct ReportWriter<'a, const N: usize> {
    out: &'a mut FixedBuf<N>,
    rank: RankInfo,
    rank_width: usize,
    color: bool,
    index_width: usize,
}

impl<'a, const N: usize> ReportWriter<'a, N> {
    /// `depth` is the number of captured frames, the handler's own included, and sets the width
    /// of the frame index column.
    pub fn new(out: &'a mut FixedBuf<N>, rank: RankInfo, color: bool, depth: usize) -> Self {
        Self {
            out,
            rank,
            rank_width: rank.label_width(),
            color,
            index_width: decimal_digits(depth as u64).max(2),
        }
    }

    fn prefix(&mut self) {
        let _ = write!(
            self.out,
            "[F::{:0width$} CRASH] ",
            self.rank.rank,
            width = self.rank_width
        );
    }

    /// A `| text` line, emphasized when color is on.
    fn emphasized(&mut self, args: std::fmt::Arguments) {
        self.prefix();
        if self.color {
            let _ = write!(self.out, "|{BOLD} {args}{RESET}{RED}\n");
        } else {
            let _ = writeln!(self.out, "| {args}");
        }
    }

    pub fn header(&mut self) {
        if self.color {
            self.out.push_str(RED);
        }
        self.prefix();
        let _ = writeln!(self.out, "{REPORT_BORDER}");
    }

    /// `| <signal description> (<cause>)`
    pub fn signal_cause(&mut self, description: &str, cause: &str) {
        self.emphasized(format_args!("{description} ({cause})"));
    }

    /// `| <text>`, used for the timeout cause and the user message.
    pub fn line(&mut self, text: &str) {
        self.emphasized(format_args!("{text}"));
    }

    pub fn no_backtrace(&mut self) {
        self.emphasized(format_args!("No backtrace stack available"));
    }

    /// `| <index> <raw-symbol> at <resolved-location>`
    pub fn frame(&mut self, index: usize, raw: &str, resolved: &str) {
        self.prefix();
        let _ = writeln!(
            self.out,
            "| {index:<width$} {raw} at {resolved}",
            width = self.index_width
        );
    }

    pub fn filtered(&mut self, count: usize) {
        self.prefix();
        let _ = writeln!(self.out, "| (Filtered {count} frames)");
    }

    pub fn footer(&mut self) {
        self.prefix();
        if self.color {
            let _ = writeln!(self.out, "{REPORT_BORDER}{RESET}");
        } else {
            let _ = writeln!(self.out, "{REPORT_BORDER}");
        }
    }
}

/// Single best-effort `write(2)`. Partial writes are not retried: the process is going down and
/// there is nothing sensible to do about them.
pub(crate) fn write_to_fd(fd: RawFd, bytes: &[u8]) -> isize {
    if bytes.is_empty() {
        return 0;
    }
    // SAFETY: the pointer and length come from a live slice.
    unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::constants::REPORT_CAPACITY;

    fn render(color: bool, rank: RankInfo) -> String {
        let mut buf = FixedBuf::<REPORT_CAPACITY>::new();
        let mut w = ReportWriter::new(&mut buf, rank, color, 3);
        w.header();
        w.signal_cause("Floating point exception", "integer divide by zero");
        w.line("step 42");
        w.frame(0, "probe(+0x10) [0x1010]", "probe.rs:10 (divide)");
        w.frame(2, "probe(+0x20) [0x1020]", "probe.rs:20 (main)");
        w.filtered(1);
        w.footer();
        buf.as_str().to_string()
    }

    #[test]
    fn test_plain_report_layout() {
        let out = render(false, RankInfo::SINGLE);
        let expected = "\
[F::000 CRASH] -------------------------------
[F::000 CRASH] | Floating point exception (integer divide by zero)
[F::000 CRASH] | step 42
[F::000 CRASH] | 0  probe(+0x10) [0x1010] at probe.rs:10 (divide)
[F::000 CRASH] | 2  probe(+0x20) [0x1020] at probe.rs:20 (main)
[F::000 CRASH] | (Filtered 1 frames)
[F::000 CRASH] -------------------------------
";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_rank_label_widens_with_job_size() {
        let out = render(false, RankInfo::new(42, 2048));
        assert!(out.lines().all(|l| l.starts_with("[F::0042 CRASH] ")));
    }

    #[test]
    fn test_color_report() {
        let out = render(true, RankInfo::SINGLE);
        assert!(out.starts_with("\x1b[31m[F::000 CRASH] ---"));
        assert!(out.contains(
            "[F::000 CRASH] |\x1b[1m Floating point exception (integer divide by zero)\x1b[0m\x1b[31m\n"
        ));
        assert!(out.contains("[F::000 CRASH] | (Filtered 1 frames)\n"));
        assert!(out.ends_with("-------------------------------\x1b[0m\n"));
    }

    #[test]
    fn test_index_width_follows_depth() {
        let mut buf = FixedBuf::<1024>::new();
        let mut w = ReportWriter::new(&mut buf, RankInfo::SINGLE, false, 120);
        w.frame(7, "raw", "loc");
        assert_eq!(buf.as_str(), "[F::000 CRASH] | 7   raw at loc\n");
    }

    #[test]
    fn test_report_never_overflows() {
        let mut buf = FixedBuf::<128>::new();
        let mut w = ReportWriter::new(&mut buf, RankInfo::SINGLE, false, 64);
        w.header();
        for i in 0..64 {
            w.frame(i, "a-rather-long-raw-symbol-text", "some/file.rs:1234 (function)");
        }
        w.footer();
        assert_eq!(buf.len(), FixedBuf::<128>::capacity());
        assert!(buf.is_truncated());
    }
}
