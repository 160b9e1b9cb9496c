//! eBPF program loader
//!
//! [`ProbeHandle`] is the single owner of everything the probe puts in the
//! kernel: the loaded object, its maps and the kprobe links. Links are
//! detached explicitly on the normal path and by `Drop` on every other path,
//! so an early return never leaves a kprobe attached.

use std::path::Path;

use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, Array, HashMap as BpfHashMap, MapData, PerCpuArray},
    programs::{kprobe::KProbeLinkId, KProbe, ProgramError},
    Bpf,
};
use latency_probe_common::{constants::*, types::*};
use log::{debug, info, warn};

use crate::error::{os_error_code, StartupError};

/// Kernel functions hooked by the probe; program names match the function names
pub const HOOKS: [&str; 3] = ["tcp_sendmsg", "tcp_recvmsg", "tcp_cleanup_rbuf"];

/// Counter values read back from the kernel, summed over all CPUs
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KernelSnapshot {
    pub counters: [u64; MAX_COUNTERS as usize],
    pub inflight_remaining: u64,
}

/// Owning handle over the loaded probe
pub struct ProbeHandle {
    ebpf: Bpf,
    links: Vec<(&'static str, KProbeLinkId)>,
}

impl ProbeHandle {
    /// Load the eBPF object from `path`, or from the embedded bytecode
    pub fn load(path: Option<&Path>) -> Result<Self> {
        bump_memlock_rlimit();

        let ebpf = match path {
            Some(obj_path) => {
                info!("Loading eBPF object from {:?}", obj_path);
                let data = std::fs::read(obj_path)
                    .with_context(|| format!("Failed to read eBPF object file {:?}", obj_path))?;
                Bpf::load(&data).map_err(|e| StartupError::Load(e.to_string()))?
            }
            None => Bpf::load(embedded_object()?).map_err(|e| StartupError::Load(e.to_string()))?,
        };

        info!("eBPF object loaded");
        Ok(Self {
            ebpf,
            links: Vec::new(),
        })
    }

    /// Write runtime settings into CONFIG. Must happen before attach.
    pub fn configure(&mut self, config: &ProbeConfig) -> Result<()> {
        let mut map: Array<_, ProbeConfig> = Array::try_from(
            self.ebpf
                .map_mut("CONFIG")
                .context("CONFIG map not found in eBPF object")?,
        )?;
        map.set(0, config, 0).context("Failed to write probe config")?;
        debug!("Probe config: {:?}", config);
        Ok(())
    }

    /// Take ownership of the process scoping set
    pub fn take_target_pids(&mut self) -> Result<BpfHashMap<MapData, u32, u8>> {
        let map = self
            .ebpf
            .take_map("TARGET_PIDS")
            .context("TARGET_PIDS map not found in eBPF object")?;
        Ok(BpfHashMap::try_from(map)?)
    }

    /// Take ownership of the per-CPU event channel
    pub fn take_event_channel(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map("EVENTS")
            .context("EVENTS map not found in eBPF object")?;
        AsyncPerfEventArray::try_from(map)
            .context("Failed to create AsyncPerfEventArray from EVENTS map")
    }

    /// Load and attach all kprobes. Nothing is retried: the first failure is
    /// returned and whatever was attached so far is detached.
    pub fn attach(&mut self) -> Result<(), StartupError> {
        info!("Attaching kprobes...");
        for hook in HOOKS {
            match self.attach_one(hook) {
                Ok(link) => {
                    self.links.push((hook, link));
                    info!("  ✓ Attached to {}", hook);
                }
                Err(e) => {
                    self.detach();
                    return Err(e);
                }
            }
        }
        info!("All kprobes attached");
        Ok(())
    }

    fn attach_one(&mut self, hook: &'static str) -> Result<KProbeLinkId, StartupError> {
        let program: &mut KProbe = self
            .ebpf
            .program_mut(hook)
            .ok_or_else(|| StartupError::ProgramMissing {
                program: hook.to_string(),
            })?
            .try_into()
            .map_err(|e: ProgramError| StartupError::Load(format!("{} is not a kprobe: {}", hook, e)))?;

        program.load().map_err(|e| classify_load_error(hook, e))?;
        program.attach(hook, 0).map_err(|e| classify_attach_error(hook, e))
    }

    /// Detach every kprobe still attached. Safe to call more than once.
    pub fn detach(&mut self) {
        for (hook, link) in self.links.drain(..) {
            let program: Option<&mut KProbe> = self
                .ebpf
                .program_mut(hook)
                .and_then(|program| program.try_into().ok());
            match program {
                Some(program) => match program.detach(link) {
                    Ok(()) => debug!("Detached {}", hook),
                    Err(e) => warn!("Failed to detach {}: {}", hook, e),
                },
                None => warn!("Program {} vanished before detach", hook),
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.links.is_empty()
    }

    /// Read counters and the in-flight table size
    pub fn snapshot(&self) -> Result<KernelSnapshot> {
        let mut snapshot = KernelSnapshot::default();

        let counters: PerCpuArray<_, u64> = PerCpuArray::try_from(
            self.ebpf
                .map("COUNTERS")
                .context("COUNTERS map not found in eBPF object")?,
        )?;
        for (slot, value) in snapshot.counters.iter_mut().enumerate() {
            let per_cpu = counters
                .get(&(slot as u32), 0)
                .with_context(|| format!("Failed to read counter {}", slot))?;
            *value = per_cpu.iter().sum();
        }

        let inflight: BpfHashMap<_, u64, InflightEntry> = BpfHashMap::try_from(
            self.ebpf
                .map("INFLIGHT")
                .context("INFLIGHT map not found in eBPF object")?,
        )?;
        snapshot.inflight_remaining = inflight.keys().filter_map(|key| key.ok()).count() as u64;

        Ok(snapshot)
    }

    /// Detach and release every map and program
    pub fn close(mut self) {
        self.detach();
        info!("Probe detached, kernel state released");
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        if self.is_attached() {
            warn!("Probe dropped while attached, detaching");
            self.detach();
        }
    }
}

fn classify_load_error(program: &str, err: ProgramError) -> StartupError {
    match err {
        ProgramError::LoadError {
            io_error,
            verifier_log,
        } => {
            if io_error.raw_os_error() == Some(libc::EPERM) {
                StartupError::CapabilityDenied {
                    missing: format!("BPF_PROG_LOAD denied for {}", program),
                }
            } else {
                StartupError::VerifierRejected {
                    program: program.to_string(),
                    log: verifier_log.to_string(),
                }
            }
        }
        other => StartupError::Load(format!("{}: {}", program, other)),
    }
}

fn classify_attach_error(symbol: &str, err: ProgramError) -> StartupError {
    match os_error_code(&err) {
        Some(libc::ENOENT) | Some(libc::EINVAL) if !kernel_symbol_exists(symbol) => {
            StartupError::SymbolNotFound {
                symbol: symbol.to_string(),
            }
        }
        Some(libc::EPERM) | Some(libc::EACCES) => StartupError::CapabilityDenied {
            missing: format!("perf_event_open denied for {}", symbol),
        },
        _ => StartupError::Attach {
            program: symbol.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Whether `symbol` is a function listed in /proc/kallsyms
fn kernel_symbol_exists(symbol: &str) -> bool {
    match std::fs::read_to_string("/proc/kallsyms") {
        Ok(contents) => kallsyms_contains(&contents, symbol),
        // Without kallsyms we cannot tell, assume present
        Err(_) => true,
    }
}

fn kallsyms_contains(contents: &str, symbol: &str) -> bool {
    contents.lines().any(|line| {
        let mut fields = line.split_whitespace();
        matches!(
            (fields.next(), fields.next(), fields.next()),
            (Some(_), Some("T" | "t"), Some(name)) if name == symbol
        )
    })
}

#[cfg(feature = "embedded")]
fn embedded_object() -> Result<&'static [u8]> {
    info!("Loading embedded eBPF program...");
    Ok(aya::include_bytes_aligned!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../target/bpfel-unknown-none/release/latency-probe"
    )))
}

#[cfg(not(feature = "embedded"))]
fn embedded_object() -> Result<&'static [u8]> {
    Err(StartupError::InvalidArgument(
        "no eBPF object file provided; use --ebpf-object or build with the 'embedded' feature"
            .to_string(),
    )
    .into())
}

/// Maps live in locked memory; lift the limit for kernels without memcg accounting
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("Removing the memlock limit failed, ret is: {}", ret);
    }
}
