// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::emitters::{write_to_fd, ReportWriter};
use super::frames::{self, CapturedFrames};
use super::platform::{fault_address, interrupted_ip};
use super::signal_handler_manager::{restore_default, revert_all};
use super::siginfo_strings::{cause_phrase, is_user_generated, reports_address, signal_description};
use super::state::{ConfigView, SNAPSHOT};
use super::symbolizer::{
    write_raw_symbol, Addr2LineSymbolizer, AddressResolver, DladdrResolver, ModuleLocation,
    SymbolText, Symbolizer,
};
use super::timeout::TIMEOUT_REACHED;
use crate::shared::configuration::PostAction;
use crate::shared::constants::{REPORT_CAPACITY, UNRESOLVED_MARKER};
use crate::shared::fixed_buf::FixedBuf;
use crate::unix_utils::ForkExecRunner;
use libc::{c_void, siginfo_t};
use std::ffi::CStr;
use std::fmt::Write;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - _exit
// - clock_gettime
// - close
// - dladdr (not listed, but only reads loader tables)
// - dup2
// - execve
// - fork (on MacOS; Linux calls `clone()` directly as syscall)
// - kill
// - nanosleep
// - pause
// - poll
// - raise
// - read
// - sigaction
// - waitpid
// - write

static NUM_TIMES_CALLED: AtomicU64 = AtomicU64::new(0);

/// The facts about one delivered signal that the handler acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    pub signum: i32,
    pub si_code: i32,
    pub fault_address: usize,
    /// Instruction pointer of the interrupted code, when the signal context provides one.
    pub interrupted_ip: Option<usize>,
    /// Entry point of the signal handler, used to strip the handler's own frames.
    pub handler_entry: usize,
    pub timeout_reached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not reported; the signal goes back to its previous disposition.
    Suppressed,
    /// Report written; carry out the configured action.
    PostAction(PostAction),
}

/// Everything the crash handler may do to the outside world while a fault is in progress.
/// Implementations must be async-signal-safe and must not allocate; the symbolizer subprocess is
/// the one accepted blocking operation.
pub trait FaultContext {
    /// Restores every disposition we replaced.
    fn revert_handlers(&mut self, view: &ConfigView);
    fn capture(&mut self, frames: &mut CapturedFrames);
    fn locate(&self, address: usize) -> Option<ModuleLocation<'_>>;
    fn symbolize(
        &self,
        view: &ConfigView,
        module: &CStr,
        link_address: usize,
        out: &mut SymbolText,
    ) -> bool;
    fn write_report(&mut self, fd: RawFd, report: &[u8]);
}

fn is_silent_abort(view: &ConfigView, event: &FaultEvent) -> bool {
    view.suppress_silent_abort
        && event.signum == libc::SIGABRT
        && is_user_generated(event.si_code)
        && !event.timeout_reached
}

fn write_cause<const N: usize>(
    w: &mut ReportWriter<'_, N>,
    view: &ConfigView,
    event: &FaultEvent,
) {
    let mut text = SymbolText::new();
    match &view.timeout {
        Some(timeout) if event.timeout_reached && event.signum == timeout.handler.signum => {
            let _ = write!(
                text,
                "Reached {:.6} seconds timeout (set at {})",
                timeout.seconds, timeout.call_site
            );
            w.line(text.as_str());
        }
        _ => {
            text.push_str(cause_phrase(event.signum, event.si_code));
            if reports_address(event.signum) {
                let _ = write!(text, " at {:#x}", event.fault_address);
            }
            w.signal_cause(signal_description(event.signum), text.as_str());
        }
    }
}

/// Runs the crash handler state machine for one fault:
///
/// 1. silent `SIGABRT`s are reverted and handed back untouched, when so configured;
/// 2. every handler we installed is reverted, before anything else can fail;
/// 3. the cause line is resolved from the signal and its `si_code`;
/// 4. the stack is captured and the handler's own frames stripped;
/// 5. each remaining frame is located, symbolized and filtered;
/// 6. the report is written with a single `write(2)`.
///
/// The post action is returned rather than performed so that this can be driven with synthetic
/// events.
pub fn handle_fault<C: FaultContext>(
    ctx: &mut C,
    view: &ConfigView,
    event: &FaultEvent,
) -> Outcome {
    if is_silent_abort(view, event) {
        ctx.revert_handlers(view);
        return Outcome::Suppressed;
    }
    ctx.revert_handlers(view);

    let mut captured = CapturedFrames::new();
    ctx.capture(&mut captured);
    let start = captured.first_reported(event.interrupted_ip, event.handler_entry);
    let reported = &captured.ips()[start..];
    let reported = &reported[..reported.len().min(view.max_frames)];
    // Index column sized for the whole captured depth, stripped frames included.
    let depth = start + reported.len();

    let mut report = FixedBuf::<REPORT_CAPACITY>::new();
    let mut w = ReportWriter::new(&mut report, view.rank, view.use_color, depth);
    w.header();
    write_cause(&mut w, view, event);
    if !view.message.is_empty() {
        w.line(view.message.as_str());
    }
    if reported.is_empty() {
        w.no_backtrace();
    } else {
        let mut filtered = 0;
        for (index, &ip) in reported.iter().enumerate() {
            // Past the first frame these are return addresses; the call is the byte before.
            let lookup = if index == 0 { ip } else { ip.saturating_sub(1) };
            let location = ctx.locate(lookup);

            let mut raw = SymbolText::new();
            write_raw_symbol(&mut raw, ip, location.as_ref());
            let mut resolved = SymbolText::new();
            let found = location.as_ref().is_some_and(|loc| {
                ctx.symbolize(view, loc.path, loc.link_address(lookup), &mut resolved)
            });
            if !found {
                resolved.set(UNRESOLVED_MARKER);
            }

            if view.filter.matches(raw.as_str(), resolved.as_str()) {
                filtered += 1;
                continue;
            }
            w.frame(index, raw.as_str(), resolved.as_str());
        }
        if filtered > 0 {
            w.filtered(filtered);
        }
    }
    w.footer();
    ctx.write_report(view.output_fd, report.as_bytes());
    Outcome::PostAction(view.post_action)
}

/// The real thing: operates on this process.
struct SignalFaultContext<'a> {
    resolver: DladdrResolver<'a>,
}

impl FaultContext for SignalFaultContext<'_> {
    fn revert_handlers(&mut self, view: &ConfigView) {
        let timeout = view.timeout.as_ref().map(|t| &t.handler);
        revert_all(view.signals.iter().chain(timeout), view.output_fd);
    }

    fn capture(&mut self, frames: &mut CapturedFrames) {
        // SAFETY: only one fault is ever handled per process; see `NUM_TIMES_CALLED`.
        unsafe { frames::capture(frames) }
    }

    fn locate(&self, address: usize) -> Option<ModuleLocation<'_>> {
        self.resolver.locate(address)
    }

    fn symbolize(
        &self,
        view: &ConfigView,
        module: &CStr,
        link_address: usize,
        out: &mut SymbolText,
    ) -> bool {
        let Some(program) = view.symbolizer.as_deref() else {
            return false;
        };
        Addr2LineSymbolizer::new(program, ForkExecRunner::new(view.symbolizer_timeout))
            .resolve(module, link_address, out)
    }

    fn write_report(&mut self, fd: RawFd, report: &[u8]) {
        write_to_fd(fd, report);
    }
}

fn perform(outcome: Outcome, view: &ConfigView, signum: i32) {
    match outcome {
        Outcome::Suppressed | Outcome::PostAction(PostAction::Raise) => {
            // Our handlers are gone; this goes to whatever was there before.
            // SAFETY: no preconditions.
            unsafe { libc::raise(signum) };
        }
        Outcome::PostAction(PostAction::Exit) => {
            std::thread::sleep(view.exit_delay);
            // SAFETY: no preconditions.
            unsafe { libc::_exit(signum) }
        }
        Outcome::PostAction(PostAction::Freeze) => loop {
            // SAFETY: no preconditions.
            unsafe { libc::pause() };
        },
    }
}

/// Signal entry point for every intercepted signal and for the timeout signal.
pub(crate) extern "C" fn handle_fault_signal(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    // One fault per process. Another thread faulting concurrently waits here until the first
    // one has finished with the process.
    if NUM_TIMES_CALLED.fetch_add(1, SeqCst) > 0 {
        loop {
            // SAFETY: no preconditions.
            unsafe { libc::pause() };
        }
    }

    let Some(view) = SNAPSHOT.begin_fault() else {
        restore_default(signum);
        // SAFETY: no preconditions.
        unsafe { libc::raise(signum) };
        return;
    };

    let event = FaultEvent {
        signum,
        si_code: if sig_info.is_null() {
            0
        } else {
            // SAFETY: the kernel passes a valid siginfo to SA_SIGINFO handlers.
            unsafe { (*sig_info).si_code }
        },
        // SAFETY: pointers come straight from the kernel.
        fault_address: unsafe { fault_address(sig_info) },
        // SAFETY: as above.
        interrupted_ip: unsafe { interrupted_ip(ucontext) },
        handler_entry: handle_fault_signal as usize,
        timeout_reached: TIMEOUT_REACHED.load(SeqCst),
    };
    let mut ctx = SignalFaultContext {
        resolver: DladdrResolver::new(&view.executable),
    };
    let outcome = handle_fault(&mut ctx, view, &event);
    perform(outcome, view, signum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::signal_handler_manager::{InterceptedSignal, SignalTable};
    use crate::collector::stack_filter::StackFilter;
    use crate::collector::timeout::{CallSite, TimeoutView};
    use crate::shared::rank::RankInfo;
    use crate::collector::siginfo_strings::siginfo_code::SI_USER;
    use crate::collector::state::Message;
    use crate::collector::symbolizer::ExecutableImage;
    use std::time::Duration;

    #[derive(Debug, PartialEq, Eq)]
    enum Call {
        Revert,
        Capture,
        Symbolize(usize),
        Write,
    }

    /// Synthetic process: every frame lives in `/opt/app/solver` at base 0x1000 with the symbol
    /// `step` at 0x1100, and resolves to `solver.c:<relative address>`.
    #[derive(Default)]
    struct Recorder {
        calls: std::cell::RefCell<Vec<Call>>,
        frames: Vec<(usize, usize)>,
        fixed_address: bool,
        report: String,
    }

    impl Recorder {
        fn with_frames(frames: &[(usize, usize)]) -> Self {
            Self {
                frames: frames.to_vec(),
                ..Default::default()
            }
        }
    }

    impl FaultContext for Recorder {
        fn revert_handlers(&mut self, _view: &ConfigView) {
            self.calls.borrow_mut().push(Call::Revert);
        }

        fn capture(&mut self, frames: &mut CapturedFrames) {
            self.calls.borrow_mut().push(Call::Capture);
            for (ip, symbol) in &self.frames {
                frames.push(*ip, *symbol);
            }
        }

        fn locate(&self, address: usize) -> Option<ModuleLocation<'_>> {
            (address >= 0x1000).then_some(ModuleLocation {
                path: c"/opt/app/solver",
                base: 0x1000,
                symbol: Some((c"step", 0x1100)),
                fixed_address: self.fixed_address,
            })
        }

        fn symbolize(
            &self,
            _view: &ConfigView,
            _module: &CStr,
            address: usize,
            out: &mut SymbolText,
        ) -> bool {
            self.calls.borrow_mut().push(Call::Symbolize(address));
            if address >= 0x900 {
                return false;
            }
            let _ = write!(out, "solver.c:{address}");
            true
        }

        fn write_report(&mut self, fd: RawFd, report: &[u8]) {
            assert_eq!(fd, 7);
            self.calls.borrow_mut().push(Call::Write);
            self.report = String::from_utf8(report.to_vec()).unwrap();
        }
    }

    fn view() -> ConfigView {
        ConfigView {
            output_fd: 7,
            use_color: false,
            post_action: PostAction::Exit,
            max_frames: 16,
            message: Message::new(),
            filter: StackFilter::new(),
            rank: RankInfo::SINGLE,
            signals: SignalTable::new(),
            timeout: None,
            exit_delay: Duration::ZERO,
            symbolizer: None,
            symbolizer_timeout: Duration::from_secs(1),
            executable: ExecutableImage::default(),
            suppress_silent_abort: false,
        }
    }

    const HANDLER: usize = 0xbeef;

    fn event(signum: i32, si_code: i32) -> FaultEvent {
        FaultEvent {
            signum,
            si_code,
            fault_address: 0,
            interrupted_ip: Some(0x1200),
            handler_entry: HANDLER,
            timeout_reached: false,
        }
    }

    /// capture helper, handler entry, trampoline, then the program's frames.
    fn fault_stack() -> Recorder {
        Recorder::with_frames(&[
            (0x10, 0x10),
            (0x20, HANDLER),
            (0x30, 0x30),
            (0x1200, 0x1100),
            (0x1301, 0x1300),
            (0x1401, 0x1400),
        ])
    }

    #[test]
    fn test_reverts_before_anything_else() {
        let mut ctx = fault_stack();
        let outcome = handle_fault(&mut ctx, &view(), &event(libc::SIGSEGV, 1));
        assert_eq!(outcome, Outcome::PostAction(PostAction::Exit));
        let calls = ctx.calls.borrow();
        assert_eq!(calls.first(), Some(&Call::Revert));
        assert_eq!(calls.get(1), Some(&Call::Capture));
        assert_eq!(calls.last(), Some(&Call::Write));
        assert_eq!(calls.iter().filter(|c| **c == Call::Revert).count(), 1);
    }

    #[test]
    fn test_report_for_divide_by_zero() {
        let mut ctx = fault_stack();
        let fpe_intdiv = 1;
        handle_fault(&mut ctx, &view(), &event(libc::SIGFPE, fpe_intdiv));
        let expected = "\
[F::000 CRASH] -------------------------------
[F::000 CRASH] | Floating point exception (integer divide by zero)
[F::000 CRASH] | 0  /opt/app/solver(step+0x100) [0x1200] at solver.c:512
[F::000 CRASH] | 1  /opt/app/solver(step+0x201) [0x1301] at solver.c:768
[F::000 CRASH] | 2  /opt/app/solver(step+0x301) [0x1401] at solver.c:1024
[F::000 CRASH] -------------------------------
";
        assert_eq!(ctx.report, expected);
        // The first frame is the faulting instruction; the others are return addresses.
        let calls = ctx.calls.borrow();
        assert!(calls.contains(&Call::Symbolize(0x200)));
        assert!(calls.contains(&Call::Symbolize(0x300)));
        assert!(calls.contains(&Call::Symbolize(0x400)));
    }

    #[test]
    fn test_handler_frames_never_reported() {
        let mut ctx = fault_stack();
        let mut event = event(libc::SIGBUS, 2);
        event.interrupted_ip = None;
        handle_fault(&mut ctx, &view(), &event);
        assert!(!ctx.report.contains("[0x10]"));
        assert!(!ctx.report.contains("[0x20]"));
        assert!(!ctx.report.contains("[0x30]"));
        assert!(ctx.report.contains("| 0  /opt/app/solver(step+0x100) [0x1200]"));
    }

    #[test]
    fn test_segv_cause_carries_address() {
        let mut ctx = fault_stack();
        let mut event = event(libc::SIGSEGV, 1);
        event.fault_address = 0x8;
        handle_fault(&mut ctx, &view(), &event);
        assert!(ctx
            .report
            .contains("| Segmentation fault (address not mapped to object at 0x8)\n"));
    }

    #[test]
    fn test_message_and_unresolved_frames() {
        let mut ctx = Recorder::with_frames(&[(0x1200, 0x1100), (0x1a01, 0x1a00), (0x50, 0)]);
        let mut view = view();
        view.message.set("iteration 42 of the pressure solve");
        let mut event = event(libc::SIGILL, 1);
        event.interrupted_ip = Some(0x1200);
        handle_fault(&mut ctx, &view, &event);
        let lines: Vec<&str> = ctx.report.lines().collect();
        assert_eq!(lines[1], "[F::000 CRASH] | Illegal instruction (illegal opcode)");
        assert_eq!(lines[2], "[F::000 CRASH] | iteration 42 of the pressure solve");
        assert_eq!(
            lines[4],
            "[F::000 CRASH] | 1  /opt/app/solver(step+0x901) [0x1a01] at ??? (could not resolve)"
        );
        assert_eq!(
            lines[5],
            "[F::000 CRASH] | 2  [0x50] at ??? (could not resolve)"
        );
    }

    #[test]
    fn test_filtered_frames_keep_their_index() {
        let mut ctx = fault_stack();
        let mut view = view();
        view.filter.add("solver.c:768");
        handle_fault(&mut ctx, &view, &event(libc::SIGFPE, 1));
        let lines: Vec<&str> = ctx.report.lines().collect();
        assert!(lines[2].contains("| 0  "));
        assert!(lines[3].contains("| 2  "));
        assert_eq!(lines[4], "[F::000 CRASH] | (Filtered 1 frames)");
        assert!(!ctx.report.contains("solver.c:768"));
    }

    #[test]
    fn test_fixed_address_module_gets_absolute_addresses() {
        let mut ctx = fault_stack();
        ctx.fixed_address = true;
        handle_fault(&mut ctx, &view(), &event(libc::SIGFPE, 1));
        let calls = ctx.calls.borrow();
        assert!(calls.contains(&Call::Symbolize(0x1200)));
        assert!(calls.contains(&Call::Symbolize(0x1300)));
        assert!(!calls.contains(&Call::Symbolize(0x200)));
        // The raw text keeps the module-relative form.
        assert!(ctx.report.contains("/opt/app/solver(step+0x100) [0x1200]"));
    }

    #[test]
    fn test_index_width_counts_stripped_frames() {
        // 40 handler and unwinder frames, then 64 program frames: 104 captured in total.
        let mut frames: Vec<(usize, usize)> = (0..40).map(|i| (0x10 + i, 0x10 + i)).collect();
        frames.extend((0..64).map(|i| (0x1200 + 0x10 * i, 0x1100)));
        let mut ctx = Recorder::with_frames(&frames);
        let mut view = view();
        view.max_frames = 64;
        handle_fault(&mut ctx, &view, &event(libc::SIGFPE, 1));
        let lines: Vec<&str> = ctx.report.lines().collect();
        assert!(lines[2].starts_with("[F::000 CRASH] | 0   /opt/app/solver"), "{}", lines[2]);
        assert!(lines[65].starts_with("[F::000 CRASH] | 63  /opt/app/solver"), "{}", lines[65]);
    }

    #[test]
    fn test_max_frames_limits_report() {
        let mut ctx = fault_stack();
        let mut view = view();
        view.max_frames = 1;
        handle_fault(&mut ctx, &view, &event(libc::SIGFPE, 1));
        assert!(ctx.report.contains("| 0 "));
        assert!(!ctx.report.contains("[0x1301]"));
    }

    #[test]
    fn test_no_backtrace() {
        let mut ctx = Recorder::default();
        handle_fault(&mut ctx, &view(), &event(libc::SIGTERM, 0));
        assert!(ctx
            .report
            .contains("[F::000 CRASH] | No backtrace stack available\n"));
    }

    fn timeout_view(signum: i32) -> TimeoutView {
        TimeoutView {
            seconds: 0.1,
            call_site: CallSite::new("probe.rs", 17),
            handler: InterceptedSignal {
                signum,
                // SAFETY: zeroed sigaction is SIG_DFL.
                previous: unsafe { std::mem::zeroed() },
            },
        }
    }

    #[test]
    fn test_timeout_cause() {
        let signum = libc::SIGUSR2;
        let mut view = view();
        view.timeout = Some(timeout_view(signum));
        let mut event = event(signum, -6);
        event.timeout_reached = true;
        let mut ctx = fault_stack();
        handle_fault(&mut ctx, &view, &event);
        assert_eq!(
            ctx.report.lines().nth(1),
            Some("[F::000 CRASH] | Reached 0.100000 seconds timeout (set at probe.rs:17)")
        );

        // The same signal without an expired deadline is reported like any other.
        event.timeout_reached = false;
        let mut ctx = fault_stack();
        handle_fault(&mut ctx, &view, &event);
        assert!(!ctx.report.contains("Reached"));
    }

    #[test]
    fn test_silent_abort_rule() {
        let mut view = view();
        let user_abort = event(libc::SIGABRT, SI_USER);

        let mut ctx = fault_stack();
        assert!(matches!(
            handle_fault(&mut ctx, &view, &user_abort),
            Outcome::PostAction(_)
        ));

        view.suppress_silent_abort = true;
        let mut ctx = fault_stack();
        assert_eq!(handle_fault(&mut ctx, &view, &user_abort), Outcome::Suppressed);
        assert_eq!(*ctx.calls.borrow(), vec![Call::Revert]);
        assert!(ctx.report.is_empty());

        // An abort while a deadline has expired is still reported.
        let mut timed_out = user_abort;
        timed_out.timeout_reached = true;
        let mut ctx = fault_stack();
        assert!(matches!(
            handle_fault(&mut ctx, &view, &timed_out),
            Outcome::PostAction(_)
        ));

        // So is an abort the kernel raised.
        let mut ctx = fault_stack();
        assert!(matches!(
            handle_fault(&mut ctx, &view, &event(libc::SIGABRT, 0x80)),
            Outcome::PostAction(_)
        ));
    }

    #[test]
    fn test_post_action_comes_from_view() {
        let mut view = view();
        view.post_action = PostAction::Freeze;
        let mut ctx = fault_stack();
        assert_eq!(
            handle_fault(&mut ctx, &view, &event(libc::SIGSEGV, 1)),
            Outcome::PostAction(PostAction::Freeze)
        );
    }
}
