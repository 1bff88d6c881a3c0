// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Human readable names for signals and their `si_code` values.
//!
//! Everything here returns `&'static str` so it can be used while handling a fault.

// These are defined in siginfo.h. The libc crate only exposes a few of them, and the numeric
// values differ between Linux and macOS, so both vocabularies are spelled out here.
#[cfg(target_os = "linux")]
pub mod siginfo_code {
    pub const SI_USER: i32 = 0;
    pub const SI_KERNEL: i32 = 0x80;
    pub const SI_QUEUE: i32 = -1;
    pub const SI_TIMER: i32 = -2;
    pub const SI_MESGQ: i32 = -3;
    pub const SI_ASYNCIO: i32 = -4;
    pub const SI_SIGIO: i32 = -5;
    pub const SI_TKILL: i32 = -6;

    pub mod ill {
        pub const ILLOPC: i32 = 1;
        pub const ILLOPN: i32 = 2;
        pub const ILLADR: i32 = 3;
        pub const ILLTRP: i32 = 4;
        pub const PRVOPC: i32 = 5;
        pub const PRVREG: i32 = 6;
        pub const COPROC: i32 = 7;
        pub const BADSTK: i32 = 8;
    }

    pub mod fpe {
        pub const INTDIV: i32 = 1;
        pub const INTOVF: i32 = 2;
        pub const FLTDIV: i32 = 3;
        pub const FLTOVF: i32 = 4;
        pub const FLTUND: i32 = 5;
        pub const FLTRES: i32 = 6;
        pub const FLTINV: i32 = 7;
        pub const FLTSUB: i32 = 8;
    }

    pub use super::common_codes::*;
}

#[cfg(target_os = "macos")]
pub mod siginfo_code {
    pub const SI_USER: i32 = 0x10001;
    pub const SI_QUEUE: i32 = 0x10002;
    pub const SI_TIMER: i32 = 0x10003;
    pub const SI_ASYNCIO: i32 = 0x10004;
    pub const SI_MESGQ: i32 = 0x10005;

    pub mod ill {
        pub const ILLOPC: i32 = 1;
        pub const ILLTRP: i32 = 2;
        pub const PRVOPC: i32 = 3;
        pub const ILLOPN: i32 = 4;
        pub const ILLADR: i32 = 5;
        pub const PRVREG: i32 = 6;
        pub const COPROC: i32 = 7;
        pub const BADSTK: i32 = 8;
    }

    pub mod fpe {
        pub const FLTDIV: i32 = 1;
        pub const FLTOVF: i32 = 2;
        pub const FLTUND: i32 = 3;
        pub const FLTRES: i32 = 4;
        pub const FLTINV: i32 = 5;
        pub const FLTSUB: i32 = 6;
        pub const INTDIV: i32 = 7;
        pub const INTOVF: i32 = 8;
    }

    pub use super::common_codes::*;
}

// Same values on both platforms.
mod common_codes {
    pub mod segv {
        pub const MAPERR: i32 = 1;
        pub const ACCERR: i32 = 2;
    }

    pub mod bus {
        pub const ADRALN: i32 = 1;
        pub const ADRERR: i32 = 2;
        pub const OBJERR: i32 = 3;
    }

    pub mod trap {
        pub const BRKPT: i32 = 1;
        pub const TRACE: i32 = 2;
    }

    pub mod cld {
        pub const EXITED: i32 = 1;
        pub const KILLED: i32 = 2;
        pub const DUMPED: i32 = 3;
        pub const TRAPPED: i32 = 4;
        pub const STOPPED: i32 = 5;
        pub const CONTINUED: i32 = 6;
    }
}

use siginfo_code::*;

pub const UNKNOWN_CAUSE: &str = "<unknown reason>";

/// Short phrase describing why `signum` was delivered, from its `si_code`.
/// Each fault family has its own vocabulary; other signals share the "who sent it" vocabulary.
pub fn cause_phrase(signum: i32, si_code: i32) -> &'static str {
    let phrase = match signum {
        libc::SIGILL => match si_code {
            ill::ILLOPC => Some("illegal opcode"),
            ill::ILLOPN => Some("illegal operand"),
            ill::ILLADR => Some("illegal addressing mode"),
            ill::ILLTRP => Some("illegal trap"),
            ill::PRVOPC => Some("privileged opcode"),
            ill::PRVREG => Some("privileged register"),
            ill::COPROC => Some("coprocessor error"),
            ill::BADSTK => Some("internal stack error"),
            _ => None,
        },
        libc::SIGTRAP => match si_code {
            trap::BRKPT => Some("process breakpoint"),
            trap::TRACE => Some("process trace trap"),
            _ => None,
        },
        libc::SIGBUS => match si_code {
            bus::ADRALN => Some("invalid address alignment"),
            bus::ADRERR => Some("nonexistent physical address"),
            bus::OBJERR => Some("object-specific hardware error"),
            _ => None,
        },
        libc::SIGFPE => match si_code {
            fpe::INTDIV => Some("integer divide by zero"),
            fpe::INTOVF => Some("integer overflow"),
            fpe::FLTDIV => Some("floating-point divide by zero"),
            fpe::FLTOVF => Some("floating-point overflow"),
            fpe::FLTUND => Some("floating-point underflow"),
            fpe::FLTRES => Some("floating-point inexact result"),
            fpe::FLTINV => Some("floating-point invalid operation"),
            fpe::FLTSUB => Some("subscript out of range"),
            _ => None,
        },
        libc::SIGSEGV => match si_code {
            segv::MAPERR => Some("address not mapped to object"),
            segv::ACCERR => Some("invalid permissions for mapped object"),
            _ => None,
        },
        libc::SIGCHLD => match si_code {
            cld::EXITED => Some("child has exited"),
            cld::KILLED => Some("child was killed"),
            cld::DUMPED => Some("child terminated abnormally"),
            cld::TRAPPED => Some("traced child has trapped"),
            cld::STOPPED => Some("child has stopped"),
            cld::CONTINUED => Some("stopped child has continued"),
            _ => None,
        },
        _ => None,
    };
    // Fault signals sent with kill(2) and friends carry a sender code instead.
    phrase
        .or_else(|| sender_phrase(si_code))
        .unwrap_or(UNKNOWN_CAUSE)
}

fn sender_phrase(si_code: i32) -> Option<&'static str> {
    match si_code {
        SI_USER => Some("sent by kill(2) or raise(3)"),
        #[cfg(target_os = "linux")]
        SI_KERNEL => Some("sent by kernel"),
        SI_QUEUE => Some("sent by sigqueue(2)"),
        SI_TIMER => Some("sent by POSIX timer expiration"),
        SI_MESGQ => Some("sent by POSIX message queue state change"),
        SI_ASYNCIO => Some("sent by AIO completion"),
        #[cfg(target_os = "linux")]
        SI_SIGIO => Some("sent by queued SIGIO"),
        #[cfg(target_os = "linux")]
        SI_TKILL => Some("sent by tkill(2) or tgkill(2)"),
        _ => None,
    }
}

/// True if the signal was sent from user space (kill, raise, abort, sigqueue) rather than
/// generated by the kernel for a fault.
pub fn is_user_generated(si_code: i32) -> bool {
    #[cfg(target_os = "linux")]
    {
        si_code <= 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        matches!(si_code, SI_USER | SI_QUEUE)
    }
}

/// Whether the cause line should mention the faulting address.
pub fn reports_address(signum: i32) -> bool {
    matches!(signum, libc::SIGSEGV | libc::SIGCHLD)
}

pub fn signal_name(signum: i32) -> &'static str {
    match signum {
        libc::SIGALRM => "SIGALRM",
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGPIPE => "SIGPIPE",
        #[cfg(target_os = "linux")]
        libc::SIGPOLL => "SIGPOLL",
        libc::SIGPROF => "SIGPROF",
        libc::SIGTERM => "SIGTERM",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGSYS => "SIGSYS",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGURG => "SIGURG",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGCONT => "SIGCONT",
        #[cfg(target_os = "linux")]
        s if (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(&s) => "SIGRT",
        _ => "SIGUNKNOWN",
    }
}

/// The text `strsignal(3)` gives on glibc. `strsignal` itself is not async-signal-safe.
pub fn signal_description(signum: i32) -> &'static str {
    match signum {
        libc::SIGALRM => "Alarm clock",
        libc::SIGHUP => "Hangup",
        libc::SIGINT => "Interrupt",
        libc::SIGKILL => "Killed",
        libc::SIGPIPE => "Broken pipe",
        #[cfg(target_os = "linux")]
        libc::SIGPOLL => "I/O possible",
        libc::SIGPROF => "Profiling timer expired",
        libc::SIGTERM => "Terminated",
        libc::SIGUSR1 => "User defined signal 1",
        libc::SIGUSR2 => "User defined signal 2",
        libc::SIGVTALRM => "Virtual timer expired",
        libc::SIGABRT => "Aborted",
        libc::SIGBUS => "Bus error",
        libc::SIGFPE => "Floating point exception",
        libc::SIGILL => "Illegal instruction",
        libc::SIGQUIT => "Quit",
        libc::SIGSEGV => "Segmentation fault",
        libc::SIGSYS => "Bad system call",
        libc::SIGTRAP => "Trace/breakpoint trap",
        libc::SIGXCPU => "CPU time limit exceeded",
        libc::SIGXFSZ => "File size limit exceeded",
        libc::SIGCHLD => "Child exited",
        libc::SIGURG => "Urgent I/O condition",
        libc::SIGSTOP => "Stopped (signal)",
        libc::SIGTSTP => "Stopped",
        libc::SIGTTIN => "Stopped (tty input)",
        libc::SIGTTOU => "Stopped (tty output)",
        libc::SIGCONT => "Continued",
        #[cfg(target_os = "linux")]
        s if (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(&s) => "Real-time signal",
        _ => "Unknown signal",
    }
}

/// Highest signal number the platform delivers.
pub fn max_signum() -> i32 {
    #[cfg(target_os = "linux")]
    {
        libc::SIGRTMAX()
    }
    #[cfg(not(target_os = "linux"))]
    {
        31
    }
}

/// Signals that can carry a handler: in range, and not one of the two uncatchable ones.
pub fn is_valid_signum(signum: i32) -> bool {
    signum > 0 && signum <= max_signum() && signum != libc::SIGKILL && signum != libc::SIGSTOP
}

/// Signals that terminate the process, with or without a core dump. Terminal and job-control
/// signals, SIGCHLD, and the user-defined signals are left to the host unless opted in.
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGALRM,
        libc::SIGPIPE,
        #[cfg(target_os = "linux")]
        libc::SIGPOLL,
        libc::SIGTERM,
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGSEGV,
        libc::SIGSYS,
        libc::SIGXCPU,
        libc::SIGXFSZ,
    ]
}
