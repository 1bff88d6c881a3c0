// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Address to module resolution and external symbolization of stack frames.

use crate::shared::constants::SMALL_BUF_SIZE;
use crate::shared::fixed_buf::FixedBuf;
use crate::unix_utils::SubprocessRunner;
use std::ffi::{CStr, CString, OsStr};
use std::fmt::Write;
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub type SymbolText = FixedBuf<SMALL_BUF_SIZE>;

/// The loaded object an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleLocation<'a> {
    pub path: &'a CStr,
    pub base: usize,
    /// Nearest exported symbol at or below the address, if the loader knows one.
    pub symbol: Option<(&'a CStr, usize)>,
    /// Linked to run at a fixed address, so its link-time addresses are the runtime ones.
    pub fixed_address: bool,
}

impl ModuleLocation<'_> {
    pub fn relative(&self, address: usize) -> usize {
        address.wrapping_sub(self.base)
    }

    /// The address as the module's debug information knows it: offset from the load base for
    /// position-independent objects, unchanged for fixed-address executables.
    pub fn link_address(&self, address: usize) -> usize {
        if self.fixed_address {
            address
        } else {
            self.relative(address)
        }
    }
}

pub trait AddressResolver {
    fn locate(&self, address: usize) -> Option<ModuleLocation<'_>>;
}

pub trait Symbolizer {
    /// Writes a short location for `link_address` inside `module`. Returns false if nothing
    /// useful could be found; `out` is left empty in that case.
    fn resolve(&self, module: &CStr, link_address: usize, out: &mut SymbolText) -> bool;
}

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const ET_EXEC: u16 = 2;

/// `e_type` of an ELF header, if `header` is one.
pub(crate) fn elf_type(header: &[u8]) -> Option<u16> {
    if header.len() < 18 || !header.starts_with(ELF_MAGIC) {
        return None;
    }
    let e_type = [header[16], header[17]];
    match header[5] {
        ELFDATA2LSB => Some(u16::from_le_bytes(e_type)),
        ELFDATA2MSB => Some(u16::from_be_bytes(e_type)),
        _ => None,
    }
}

fn is_fixed_address_executable(path: &Path) -> bool {
    let mut header = [0u8; 18];
    let read = File::open(path).and_then(|mut file| file.read_exact(&mut header));
    read.is_ok() && elf_type(&header) == Some(ET_EXEC)
}

/// Load base of the main program, found through its entry point.
#[cfg(target_os = "linux")]
fn main_program_base() -> Option<usize> {
    // SAFETY: no preconditions.
    let entry = unsafe { libc::getauxval(libc::AT_ENTRY) } as usize;
    if entry == 0 {
        return None;
    }
    // SAFETY: an all-zero `Dl_info` is a valid value for dladdr to fill in.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr accepts any address and only writes to `info`.
    let found = unsafe { libc::dladdr(entry as *const libc::c_void, &mut info) } != 0;
    found.then_some(info.dli_fbase as usize)
}

#[cfg(not(target_os = "linux"))]
fn main_program_base() -> Option<usize> {
    None
}

/// The main program of this process, inspected once at init so the fault path never has to open
/// files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutableImage {
    pub path: Option<CString>,
    pub base: Option<usize>,
    /// An `ET_EXEC` binary (non-PIE or static), symbolized with absolute addresses.
    pub fixed_address: bool,
}

impl ExecutableImage {
    pub fn current() -> Self {
        let path = current_exe();
        let fixed_address = path.as_deref().is_some_and(|p| {
            is_fixed_address_executable(Path::new(OsStr::from_bytes(p.to_bytes())))
        });
        Self {
            path,
            base: main_program_base(),
            fixed_address,
        }
    }
}

/// Resolves addresses with `dladdr(3)`, which only reads loader data structures.
#[derive(Debug, Clone, Copy)]
pub struct DladdrResolver<'a> {
    executable: &'a ExecutableImage,
}

impl<'a> DladdrResolver<'a> {
    pub fn new(executable: &'a ExecutableImage) -> Self {
        Self { executable }
    }
}

impl AddressResolver for DladdrResolver<'_> {
    fn locate(&self, address: usize) -> Option<ModuleLocation<'_>> {
        // SAFETY: an all-zero `Dl_info` is a valid value for dladdr to fill in.
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: dladdr accepts any address and only writes to `info`.
        if unsafe { libc::dladdr(address as *const libc::c_void, &mut info) } == 0 {
            return None;
        }
        let base = info.dli_fbase as usize;
        // SAFETY: on success `dli_fname` is null or a NUL terminated string owned by the
        // loader, and stays valid while the object is mapped.
        let loader_name = (!info.dli_fname.is_null())
            .then(|| unsafe { CStr::from_ptr(info.dli_fname) })
            .filter(|name| !name.is_empty());
        // The loader names the main program after argv[0], which need not be a usable path.
        let is_main = self.executable.base == Some(base);
        let path = if is_main {
            self.executable.path.as_deref().or(loader_name)
        } else {
            loader_name
        }?;
        // SAFETY: as above.
        let symbol = (!info.dli_sname.is_null())
            .then(|| unsafe { CStr::from_ptr(info.dli_sname) })
            .map(|name| (name, info.dli_saddr as usize));
        Some(ModuleLocation {
            path,
            base,
            symbol,
            fixed_address: is_main && self.executable.fixed_address,
        })
    }
}

/// Raw symbol text in the `backtrace_symbols(3)` shape: `module(symbol+0xoff) [0xaddr]`.
pub fn write_raw_symbol<const N: usize>(
    out: &mut FixedBuf<N>,
    address: usize,
    location: Option<&ModuleLocation<'_>>,
) {
    let Some(location) = location else {
        let _ = write!(out, "[{address:#x}]");
        return;
    };
    let module = utf8_prefix(location.path.to_bytes());
    match location.symbol {
        Some((name, start)) => {
            let name = utf8_prefix(name.to_bytes());
            let _ = write!(
                out,
                "{module}({name}+{:#x}) [{address:#x}]",
                address.wrapping_sub(start)
            );
        }
        None => {
            let _ = write!(
                out,
                "{module}(+{:#x}) [{address:#x}]",
                location.relative(address)
            );
        }
    }
}

/// Longest valid UTF-8 prefix; loader paths and symbol names are ASCII in practice.
fn utf8_prefix(bytes: &[u8]) -> &str {
    match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            // SAFETY: `valid_up_to` delimits a valid UTF-8 prefix.
            unsafe { std::str::from_utf8_unchecked(&bytes[..e.valid_up_to()]) }
        }
    }
}

/// Symbolizes with `addr2line -f -C -e <module> <address>` run as a subprocess.
/// Renders `file:line (function)`.
pub struct Addr2LineSymbolizer<'a, R> {
    program: &'a CStr,
    runner: R,
}

impl<'a, R: SubprocessRunner> Addr2LineSymbolizer<'a, R> {
    pub fn new(program: &'a CStr, runner: R) -> Self {
        Self { program, runner }
    }
}

fn is_unknown(field: &str) -> bool {
    field.is_empty() || field.starts_with("??")
}

/// Formats the two-line `addr2line -f` answer. Returns false if neither line is useful.
pub(crate) fn format_addr2line_output(output: &[u8], out: &mut SymbolText) -> bool {
    let text = utf8_prefix(output);
    let mut lines = text.lines();
    let function = lines.next().unwrap_or("").trim();
    // Drop the " (discriminator N)" suffix newer binutils add.
    let location = lines.next().unwrap_or("").trim();
    let location = location
        .split_once(" (discriminator")
        .map_or(location, |(loc, _)| loc);

    let known_function = !is_unknown(function);
    let known_location = !is_unknown(location);
    match (known_location, known_function) {
        (true, true) => {
            let _ = write!(out, "{location} ({function})");
        }
        (true, false) => {
            out.push_str(location);
        }
        (false, true) => {
            let _ = write!(out, "?? ({function})");
        }
        (false, false) => return false,
    }
    true
}

impl<R: SubprocessRunner> Symbolizer for Addr2LineSymbolizer<'_, R> {
    fn resolve(&self, module: &CStr, link_address: usize, out: &mut SymbolText) -> bool {
        let mut address = FixedBuf::<32>::new();
        let _ = write!(address, "{link_address:#x}");
        let argv = [
            self.program,
            c"-f",
            c"-C",
            c"-e",
            module,
            address.as_c_str(),
        ];
        let mut stdout = [0u8; SMALL_BUF_SIZE];
        match self.runner.run(&argv, &mut stdout) {
            Ok(output) if output.status == Some(0) => {
                format_addr2line_output(&stdout[..output.len], out)
            }
            _ => false,
        }
    }
}

/// Finds `program` the way a shell would, so the fault path can exec it by absolute path.
pub fn find_program(program: &str) -> Option<CString> {
    let is_executable = |path: &Path| {
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };
    let found: Option<PathBuf> = if program.contains('/') {
        let path = PathBuf::from(program);
        is_executable(&path).then_some(path)
    } else {
        let search = std::env::var_os("PATH")?;
        std::env::split_paths(&search)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    };
    found.and_then(|p| CString::new(p.as_os_str().as_bytes()).ok())
}

/// The running executable, for frames the loader cannot name.
pub fn current_exe() -> Option<CString> {
    let path = std::env::current_exe().ok()?;
    CString::new(path.as_os_str().as_bytes()).ok()
}
