//! Host capability checks
//!
//! Run before anything is loaded so a missing privilege or an old kernel is
//! reported with a precise cause instead of an opaque verifier or syscall
//! error halfway through attaching.

use aya::{util::KernelVersion, Btf};
use log::{debug, info};

use crate::error::StartupError;

/// bpf_probe_read_kernel, LRU hash maps and BTF all exist from 5.5 onwards
pub const MIN_KERNEL_VERSION: (u8, u8, u16) = (5, 5, 0);

const CAP_NET_ADMIN: u32 = 12;
const CAP_SYS_ADMIN: u32 = 21;
const CAP_PERFMON: u32 = 38;
const CAP_BPF: u32 = 39;

/// Run every check, stopping at the first failure
pub fn check_host() -> Result<(), StartupError> {
    check_kernel_version()?;
    check_btf()?;
    check_capabilities()?;
    info!("Preflight checks passed");
    Ok(())
}

pub fn check_kernel_version() -> Result<(), StartupError> {
    let (major, minor, patch) = MIN_KERNEL_VERSION;
    let required = KernelVersion::new(major, minor, patch);
    let current = KernelVersion::current().map_err(|e| StartupError::UnsupportedKernel {
        found: format!("unknown ({})", e),
        required: format!("{}.{}.{}", major, minor, patch),
    })?;

    debug!("Running on kernel {:?}", current);
    if current < required {
        return Err(StartupError::UnsupportedKernel {
            found: format!("{:?}", current),
            required: format!("{}.{}.{}", major, minor, patch),
        });
    }
    Ok(())
}

pub fn check_btf() -> Result<(), StartupError> {
    Btf::from_sys_fs()
        .map(|_| ())
        .map_err(|e| StartupError::MissingBtf(e.to_string()))
}

pub fn check_capabilities() -> Result<(), StartupError> {
    let status = procfs::process::Process::myself()
        .and_then(|process| process.status())
        .map_err(|e| StartupError::CapabilityDenied {
            missing: format!("unable to read effective capabilities: {}", e),
        })?;

    let missing = missing_capabilities(status.capeff);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StartupError::CapabilityDenied {
            missing: missing.join(", "),
        })
    }
}

/// Capabilities absent from an effective set
///
/// Instrumentation needs CAP_SYS_ADMIN, or CAP_BPF together with CAP_PERFMON;
/// reading socket state needs CAP_NET_ADMIN.
pub fn missing_capabilities(capeff: u64) -> Vec<&'static str> {
    let has = |cap: u32| capeff & (1u64 << cap) != 0;
    let mut missing = Vec::new();

    if !has(CAP_SYS_ADMIN) {
        if !has(CAP_BPF) {
            missing.push("CAP_BPF");
        }
        if !has(CAP_PERFMON) {
            missing.push("CAP_PERFMON");
        }
    }
    if !has(CAP_NET_ADMIN) {
        missing.push("CAP_NET_ADMIN");
    }
    missing
}
