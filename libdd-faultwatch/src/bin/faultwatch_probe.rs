// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small program that installs the fault handlers and then misbehaves in a chosen way, so the
//! integration tests can look at the report and the exit status of a real process.
//!
//! Usage: `faultwatch-probe [--config <json>] <mode> [args]`
//!
//! Without `--config`, the configuration is read from the `DD_FAULTWATCH_*` environment.

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use libdd_faultwatch::{FaultWatchConfiguration, PostAction, RegisterStatus};
    use std::hint::black_box;
    use std::time::{Duration, Instant};

    const BUSY_WAIT_LIMIT: Duration = Duration::from_secs(10);

    #[inline(never)]
    fn integer_divide(numerator: u32, denominator: u32) -> u32 {
        #[cfg(target_arch = "x86_64")]
        {
            let quotient: u32;
            // SAFETY: deliberately faults when `denominator` is zero.
            unsafe {
                std::arch::asm!(
                    "div {d:e}",
                    d = in(reg) denominator,
                    inout("eax") numerator => quotient,
                    inout("edx") 0u32 => _,
                );
            }
            quotient
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            // Integer division by zero does not trap on this architecture.
            if denominator == 0 {
                // SAFETY: plain raise(3).
                unsafe { libc::raise(libc::SIGFPE) };
            }
            numerator.checked_div(denominator).unwrap_or_default()
        }
    }

    #[inline(never)]
    fn read_null() {
        // SAFETY: deliberately reads address zero.
        unsafe {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            std::arch::asm!("mov eax, [0]", options(nostack));

            #[cfg(target_arch = "aarch64")]
            std::arch::asm!("mov x0, #0", "ldr x1, [x0]", options(nostack));

            #[cfg(not(any(
                target_arch = "x86",
                target_arch = "x86_64",
                target_arch = "aarch64"
            )))]
            std::ptr::read_volatile(black_box(std::ptr::null::<u8>()));
        }
    }

    #[inline(never)]
    fn solve_step(step: u32) -> u32 {
        black_box(integer_divide(black_box(step), black_box(0)))
    }

    #[inline(never)]
    fn solve() -> u32 {
        (1..4).map(|step| solve_step(black_box(step))).sum()
    }

    #[inline(never)]
    fn test_harness_run() -> u32 {
        black_box(solve())
    }

    #[inline(never)]
    fn spin_until_interrupted() -> anyhow::Result<()> {
        let start = Instant::now();
        while start.elapsed() < BUSY_WAIT_LIMIT {
            std::hint::spin_loop();
        }
        anyhow::bail!("no timeout was delivered within {BUSY_WAIT_LIMIT:?}")
    }

    fn parse_signal(arg: Option<&String>) -> anyhow::Result<i32> {
        let arg = arg.context("missing signal number")?;
        arg.parse()
            .with_context(|| format!("invalid signal number {arg}"))
    }

    pub fn main() -> anyhow::Result<()> {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(tracing::Level::WARN)
            .init();

        let mut args: Vec<String> = std::env::args().skip(1).collect();
        let config = if args.first().map(String::as_str) == Some("--config") {
            anyhow::ensure!(args.len() >= 2, "--config needs a JSON argument");
            let json = args.remove(1);
            args.remove(0);
            Some(
                serde_json::from_str::<FaultWatchConfiguration>(&json)
                    .context("parsing --config")?,
            )
        } else {
            None
        };
        let mode = args.first().context("missing mode")?.clone();

        // Misuse that must terminate the process before anything is installed.
        if mode == "timeout-before-init" {
            libdd_faultwatch::set_timeout(1.0);
            anyhow::bail!("set_timeout returned without init");
        }

        match config {
            Some(config) => libdd_faultwatch::init_with(config),
            None => libdd_faultwatch::init(),
        }

        match mode.as_str() {
            "divide-by-zero" => {
                libdd_faultwatch::set_message("iteration 42 of the pressure solve");
                black_box(solve());
            }
            "segv" => read_null(),
            "filter" => {
                libdd_faultwatch::add_stack_filter("test_harness");
                black_box(test_harness_run());
            }
            "raise" => {
                let signum = parse_signal(args.get(1))?;
                // SAFETY: plain raise(3).
                unsafe { libc::raise(signum) };
            }
            "timeout" => {
                libdd_faultwatch::set_timeout(0.1);
                spin_until_interrupted()?;
            }
            "timeout-signal-registered" => {
                let signum = libdd_faultwatch::timeout_signal();
                let status = libdd_faultwatch::register_additional_signal(signum)?;
                anyhow::ensure!(
                    status == RegisterStatus::Reserved,
                    "timeout signal {signum} registered as {status:?}"
                );
                libdd_faultwatch::set_post_action(PostAction::Raise);
                libdd_faultwatch::set_timeout(0.1);
                spin_until_interrupted()?;
            }
            "restart-timeout" => {
                libdd_faultwatch::set_timeout(0.1);
                std::thread::sleep(Duration::from_millis(50));
                libdd_faultwatch::restart_timeout();
                spin_until_interrupted()?;
            }
            "clear-timeout" => {
                libdd_faultwatch::set_timeout(0.1);
                libdd_faultwatch::clear_timeout();
                std::thread::sleep(Duration::from_millis(500));
                anyhow::ensure!(
                    !libdd_faultwatch::timeout_reached(),
                    "cleared timeout was reported as reached"
                );
                libdd_faultwatch::fini();
                return Ok(());
            }
            "deregistered" => {
                let signum = parse_signal(args.get(1))?;
                libdd_faultwatch::deregister_signal(signum)?;
                // SAFETY: plain raise(3).
                unsafe { libc::raise(signum) };
            }
            "fini" => {
                libdd_faultwatch::fini();
                // With the handlers gone, the default disposition applies.
                read_null();
            }
            other => anyhow::bail!("unknown mode {other}"),
        }
        anyhow::bail!("{mode} did not terminate the process")
    }
}
