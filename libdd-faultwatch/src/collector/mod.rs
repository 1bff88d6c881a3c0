// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod alt_stack;
mod api;
mod crash_handler;
mod emitters;
mod frames;
mod platform;
pub(crate) mod siginfo_strings;
mod signal_handler_manager;
mod stack_filter;
mod stack_trace;
mod state;
mod symbolizer;
mod timeout;

pub use alt_stack::AltStackError;
pub use api::*;
pub use crash_handler::{handle_fault, FaultContext, FaultEvent, Outcome};
pub use frames::CapturedFrames;
pub use platform::{timeout_signal, uses_alt_stack};
pub use siginfo_strings::{cause_phrase, default_signals, signal_description, signal_name};
pub use signal_handler_manager::{DeregisterStatus, RegisterStatus, SignalRegistryError};
pub use stack_filter::StackFilter;
pub use stack_trace::{capture_backtrace, Frame};
pub use state::ConfigView;
pub use symbolizer::{
    find_program, Addr2LineSymbolizer, AddressResolver, DladdrResolver, ExecutableImage,
    ModuleLocation, SymbolText, Symbolizer,
};
pub use timeout::{CallSite, TimeoutError};
