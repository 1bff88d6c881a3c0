// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack traces taken on request, outside of any fault.

use super::api::symbolizer_settings;
use super::frames::CapturedFrames;
use super::symbolizer::{
    write_raw_symbol, Addr2LineSymbolizer, AddressResolver, DladdrResolver, SymbolText, Symbolizer,
};
use crate::unix_utils::ForkExecRunner;

/// One frame of a trace taken by [`capture_backtrace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Return address into the frame's function.
    pub ip: usize,
    /// Start of the enclosing function, as the unwinder sees it.
    pub function: usize,
    /// `module(symbol+0xoff) [0xaddr]`, the same text a crash report shows.
    pub symbol: String,
    /// `file:line (function)`, when the symbolizer knew it.
    pub source: Option<String>,
}

/// Captures and symbolizes the calling thread's stack, innermost frame first, starting at the
/// caller of this function. At most `max_depth` frames are returned.
///
/// Uses the same symbolizer as crash reports: the configured one after `init`, otherwise the one
/// named by the environment.
#[inline(never)]
pub fn capture_backtrace(max_depth: usize) -> Vec<Frame> {
    let mut captured = CapturedFrames::new();
    backtrace::trace(|frame| captured.push(frame.ip() as usize, frame.symbol_address() as usize));
    let start = captured.after(capture_backtrace as usize);

    let settings = symbolizer_settings();
    let resolver = DladdrResolver::new(&settings.executable);
    let symbolizer = settings
        .program
        .as_deref()
        .map(|program| Addr2LineSymbolizer::new(program, ForkExecRunner::new(settings.timeout)));

    let ips = &captured.ips()[start..];
    let functions = &captured.symbol_addresses()[start..];
    ips.iter()
        .zip(functions)
        .take(max_depth)
        .map(|(&ip, &function)| {
            // Every frame here is a return address; the call is the byte before.
            let lookup = ip.saturating_sub(1);
            let location = resolver.locate(lookup);
            let mut symbol = SymbolText::new();
            write_raw_symbol(&mut symbol, ip, location.as_ref());
            let mut source = SymbolText::new();
            let found = match (&symbolizer, &location) {
                (Some(symbolizer), Some(location)) => {
                    symbolizer.resolve(location.path, location.link_address(lookup), &mut source)
                }
                _ => false,
            };
            Frame {
                ip,
                function,
                symbol: symbol.as_str().to_owned(),
                source: found.then(|| source.as_str().to_owned()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hint::black_box;

    #[inline(never)]
    fn traced(max_depth: usize) -> Vec<Frame> {
        black_box(capture_backtrace(black_box(max_depth)))
    }

    #[inline(never)]
    fn traced_deeper(max_depth: usize) -> Vec<Frame> {
        black_box(traced(max_depth))
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_starts_at_the_caller() {
        let frames = traced_deeper(16);
        assert!(!frames.is_empty());
        assert!(frames.len() <= 16);
        assert_eq!(frames[0].function, traced as usize);
        assert!(frames.iter().all(|f| f.function != capture_backtrace as usize));
        assert!(frames.iter().any(|f| f.function == traced_deeper as usize));
        assert!(frames.iter().all(|f| !f.symbol.is_empty()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_depth_is_bounded() {
        assert_eq!(traced_deeper(1).len(), 1);
        assert!(traced_deeper(0).is_empty());
    }
}
