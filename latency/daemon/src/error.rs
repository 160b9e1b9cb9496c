//! Failure taxonomy surfaced at the process boundary
//!
//! Startup failures abort the run before anything stays attached. Degraded
//! conditions (drops, stale entries, unmatched receives) are not errors and
//! only show up as counters in the report.

use std::path::PathBuf;
use thiserror::Error;

/// Startup-fatal failures, each with its own exit status
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("missing privileges: {missing} (run as root or grant CAP_BPF, CAP_PERFMON and CAP_NET_ADMIN)")]
    CapabilityDenied { missing: String },

    #[error("kernel type metadata (BTF) unavailable: {0}")]
    MissingBtf(String),

    #[error("unsupported kernel {found}, at least {required} is required")]
    UnsupportedKernel { found: String, required: String },

    #[error("kernel symbol {symbol} not found, cannot attach kprobe")]
    SymbolNotFound { symbol: String },

    #[error("verifier rejected program {program}:\n{log}")]
    VerifierRejected { program: String, log: String },

    #[error("program {program} not found in eBPF object")]
    ProgramMissing { program: String },

    #[error("failed to attach {program}: {reason}")]
    Attach { program: String, reason: String },

    #[error("failed to load eBPF object: {0}")]
    Load(String),

    #[error("target process {0} does not exist")]
    ProcessNotFound(u32),
}

impl StartupError {
    /// Exit status, following sysexits.h where one fits
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::InvalidArgument(_) | StartupError::ProcessNotFound(_) => 64,
            StartupError::CapabilityDenied { .. } => 77,
            StartupError::MissingBtf(_) | StartupError::UnsupportedKernel { .. } => 78,
            StartupError::SymbolNotFound { .. }
            | StartupError::VerifierRejected { .. }
            | StartupError::ProgramMissing { .. }
            | StartupError::Attach { .. }
            | StartupError::Load(_) => 79,
        }
    }
}

/// The report never reached disk
#[derive(Error, Debug)]
#[error("failed to write report to {path:?} after {attempts} attempt(s): {reason}")]
pub struct ExportError {
    pub path: PathBuf,
    pub attempts: u32,
    pub reason: String,
}

impl ExportError {
    pub const EXIT_CODE: u8 = 74;
}

/// Last OS error code found in an error's source chain
pub fn os_error_code(err: &(dyn std::error::Error + 'static)) -> Option<i32> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if let Some(code) = io.raw_os_error() {
                return Some(code);
            }
        }
        current = e.source();
    }
    None
}

/// Exit status for any error that reaches `main`
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(startup) = err.downcast_ref::<StartupError>() {
        return startup.exit_code();
    }
    if err.downcast_ref::<ExportError>().is_some() {
        return ExportError::EXIT_CODE;
    }
    1
}
