// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::collector::siginfo_strings::{default_signals, is_valid_signum};
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;

/// What the crash handler does once the report has been written.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PostAction {
    /// Sleep for the configured exit delay, then `_exit` with the signal number as status.
    /// The delay gives the other ranks of a job a chance to flush their own reports before a
    /// launcher tears the whole job down.
    #[default]
    Exit,
    /// Re-raise the signal so the previous (or default) disposition takes over.
    Raise,
    /// Wait forever so a debugger can be attached.
    Freeze,
}

impl FromStr for PostAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exit" => Ok(PostAction::Exit),
            "raise" => Ok(PostAction::Raise),
            "freeze" => Ok(PostAction::Freeze),
            other => anyhow::bail!("Unknown post action {other:?}, expected exit|raise|freeze"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultWatchConfiguration {
    create_alt_stack: bool,
    exit_delay: Duration,
    max_frames: usize,
    output_fd: RawFd,
    post_action: PostAction,
    signals: Vec<i32>,
    // Abort signals raised from user space (e.g. by a launcher that already reported the failure)
    // produce no report when set.
    suppress_silent_abort: bool,
    // `None` disables symbolization: frames are printed with the unresolved marker.
    symbolizer: Option<String>,
    symbolizer_timeout: Duration,
    use_alt_stack: bool,
    // `None` means "color if the output is a terminal".
    use_color: Option<bool>,
}

pub(crate) mod parse_env {
    use std::{env, str::FromStr, time::Duration};

    pub fn duration_ms(name: &str) -> Option<Duration> {
        Some(Duration::from_millis(int::<u64>(name)?))
    }

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.trim().parse::<T>().ok()
    }

    pub fn bool(name: &str) -> Option<bool> {
        match env::var(name).ok()?.as_str() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
            _ => Some(false),
        }
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

pub const ENV_POST_ACTION: &str = "DD_FAULTWATCH_POST_ACTION";
pub const ENV_MAX_FRAMES: &str = "DD_FAULTWATCH_MAX_FRAMES";
pub const ENV_EXIT_DELAY_MS: &str = "DD_FAULTWATCH_EXIT_DELAY_MS";
pub const ENV_COLOR: &str = "DD_FAULTWATCH_COLOR";
pub const ENV_SYMBOLIZER: &str = "DD_FAULTWATCH_ADDR2LINE";
pub const ENV_SUPPRESS_SILENT_ABORT: &str = "DD_FAULTWATCH_SUPPRESS_SILENT_ABORT";

impl Default for FaultWatchConfiguration {
    fn default() -> Self {
        Self {
            create_alt_stack: true,
            exit_delay: constants::DEFAULT_EXIT_DELAY,
            max_frames: constants::MAX_BACKTRACE_FRAMES,
            output_fd: libc::STDERR_FILENO,
            post_action: PostAction::Exit,
            signals: default_signals(),
            suppress_silent_abort: false,
            symbolizer: Some(constants::DEFAULT_SYMBOLIZER.to_string()),
            symbolizer_timeout: constants::DEFAULT_SYMBOLIZER_TIMEOUT,
            use_alt_stack: true,
            use_color: None,
        }
    }
}

impl FaultWatchConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        create_alt_stack: bool,
        use_alt_stack: bool,
        mut signals: Vec<i32>,
        output_fd: RawFd,
        use_color: Option<bool>,
        post_action: PostAction,
        max_frames: usize,
        exit_delay: Duration,
        symbolizer: Option<String>,
        symbolizer_timeout: Option<Duration>,
        suppress_silent_abort: bool,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        anyhow::ensure!(output_fd >= 0, "Invalid output file descriptor {output_fd}");
        validate_max_frames(max_frames)?;
        if signals.is_empty() {
            signals = default_signals();
        } else {
            // Registration order is preserved, but duplicates are rejected.
            let mut sorted = signals.clone();
            sorted.sort_unstable();
            sorted.dedup();
            anyhow::ensure!(
                sorted.len() == signals.len(),
                "Signals contained duplicate elements"
            );
            anyhow::ensure!(
                signals.len() <= constants::MAX_INTERCEPTED_SIGNALS,
                "At most {} signals can be intercepted",
                constants::MAX_INTERCEPTED_SIGNALS
            );
            if let Some(bad) = signals.iter().find(|s| !is_valid_signum(**s)) {
                anyhow::bail!("Invalid signal number {bad}");
            }
        }
        if let Some(symbolizer) = &symbolizer {
            anyhow::ensure!(!symbolizer.is_empty(), "Empty symbolizer path");
        }

        Ok(Self {
            create_alt_stack,
            exit_delay,
            max_frames,
            output_fd,
            post_action,
            signals,
            suppress_silent_abort,
            symbolizer,
            symbolizer_timeout: symbolizer_timeout.unwrap_or(constants::DEFAULT_SYMBOLIZER_TIMEOUT),
            use_alt_stack,
            use_color,
        })
    }

    /// The default configuration, overridden by any `DD_FAULTWATCH_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(action) = parse_env::str_not_empty(ENV_POST_ACTION) {
            config.post_action = action.parse()?;
        }
        if let Some(max_frames) = parse_env::int::<usize>(ENV_MAX_FRAMES) {
            config.set_max_frames(max_frames)?;
        }
        if let Some(delay) = parse_env::duration_ms(ENV_EXIT_DELAY_MS) {
            config.exit_delay = delay;
        }
        if let Some(color) = parse_env::bool(ENV_COLOR) {
            config.use_color = Some(color);
        }
        if let Some(symbolizer) = parse_env::str_not_empty(ENV_SYMBOLIZER) {
            config.symbolizer = match symbolizer.as_str() {
                "none" | "off" => None,
                _ => Some(symbolizer),
            };
        }
        if let Some(suppress) = parse_env::bool(ENV_SUPPRESS_SILENT_ABORT) {
            config.suppress_silent_abort = suppress;
        }
        Ok(config)
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn exit_delay(&self) -> Duration {
        self.exit_delay
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn output_fd(&self) -> RawFd {
        self.output_fd
    }

    pub fn post_action(&self) -> PostAction {
        self.post_action
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn suppress_silent_abort(&self) -> bool {
        self.suppress_silent_abort
    }

    pub fn symbolizer(&self) -> Option<&str> {
        self.symbolizer.as_deref()
    }

    pub fn symbolizer_timeout(&self) -> Duration {
        self.symbolizer_timeout
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn use_color(&self) -> Option<bool> {
        self.use_color
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_exit_delay(&mut self, exit_delay: Duration) {
        self.exit_delay = exit_delay;
    }

    pub fn set_max_frames(&mut self, max_frames: usize) -> anyhow::Result<()> {
        validate_max_frames(max_frames)?;
        self.max_frames = max_frames;
        Ok(())
    }

    pub fn set_output_fd(&mut self, output_fd: RawFd) -> anyhow::Result<()> {
        anyhow::ensure!(output_fd >= 0, "Invalid output file descriptor {output_fd}");
        self.output_fd = output_fd;
        Ok(())
    }

    pub fn set_post_action(&mut self, post_action: PostAction) {
        self.post_action = post_action;
    }

    pub fn set_suppress_silent_abort(&mut self, suppress_silent_abort: bool) {
        self.suppress_silent_abort = suppress_silent_abort;
    }

    pub fn set_symbolizer(&mut self, symbolizer: Option<String>) {
        self.symbolizer = symbolizer.filter(|s| !s.is_empty());
    }

    pub fn set_use_color(&mut self, use_color: Option<bool>) {
        self.use_color = use_color;
    }
}

pub(crate) fn validate_max_frames(max_frames: usize) -> anyhow::Result<()> {
    anyhow::ensure!(
        (1..=constants::MAX_BACKTRACE_FRAMES).contains(&max_frames),
        "max_frames must be between 1 and {}, got {max_frames}",
        constants::MAX_BACKTRACE_FRAMES
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_signals(signals: Vec<i32>) -> anyhow::Result<FaultWatchConfiguration> {
        FaultWatchConfiguration::new(
            true,
            true,
            signals,
            libc::STDERR_FILENO,
            Some(false),
            PostAction::Exit,
            constants::MAX_BACKTRACE_FRAMES,
            Duration::ZERO,
            None,
            None,
            false,
        )
    }

    #[test]
    fn test_empty_signals_means_default_set() -> anyhow::Result<()> {
        let config = config_with_signals(vec![])?;
        assert_eq!(config.signals(), &default_signals());
        Ok(())
    }

    #[test]
    fn test_signals_keep_order_and_reject_duplicates() -> anyhow::Result<()> {
        let config = config_with_signals(vec![libc::SIGTERM, libc::SIGSEGV])?;
        assert_eq!(config.signals(), &vec![libc::SIGTERM, libc::SIGSEGV]);

        assert!(config_with_signals(vec![libc::SIGSEGV, libc::SIGSEGV]).is_err());
        assert!(config_with_signals(vec![0]).is_err());
        assert!(config_with_signals(vec![-3]).is_err());
        assert!(config_with_signals(vec![libc::SIGKILL]).is_err());
        Ok(())
    }

    #[test]
    fn test_alt_stack_paradox() -> anyhow::Result<()> {
        let mut config = FaultWatchConfiguration::default();
        assert!(config.set_use_alt_stack(false).is_err());
        config.set_create_alt_stack(false)?;
        config.set_use_alt_stack(false)?;
        assert!(config.set_create_alt_stack(true).is_err());
        Ok(())
    }

    #[test]
    fn test_max_frames_bounds() {
        let mut config = FaultWatchConfiguration::default();
        assert!(config.set_max_frames(0).is_err());
        assert!(config
            .set_max_frames(constants::MAX_BACKTRACE_FRAMES + 1)
            .is_err());
        assert!(config.set_max_frames(8).is_ok());
        assert_eq!(config.max_frames(), 8);
    }

    #[test]
    fn test_post_action_from_str() {
        assert_eq!("exit".parse::<PostAction>().unwrap(), PostAction::Exit);
        assert_eq!(" RAISE ".parse::<PostAction>().unwrap(), PostAction::Raise);
        assert_eq!("freeze".parse::<PostAction>().unwrap(), PostAction::Freeze);
        assert!("explode".parse::<PostAction>().is_err());
    }

    #[test]
    fn test_serde_round_trip() -> anyhow::Result<()> {
        let mut config = FaultWatchConfiguration::default();
        config.set_post_action(PostAction::Freeze);
        config.set_use_color(Some(true));
        let json = serde_json::to_string(&config)?;
        let back: FaultWatchConfiguration = serde_json::from_str(&json)?;
        assert_eq!(config, back);
        Ok(())
    }
}
