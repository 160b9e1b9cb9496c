//! Helper functions for the kprobe handlers
//!
//! Thin wrappers around BPF helpers and the small fixed-cost map accesses
//! every hook needs.

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    programs::ProbeContext,
};
use latency_probe_common::{
    constants::{COUNTER_EVENTS_EMITTED, COUNTER_SAMPLED_OUT},
    tracker::{admit_sample, pid_in_scope},
    types::*,
};

use crate::maps::{CONFIG, COUNTERS, EVENTS, SAMPLER, TARGET_PIDS};

/// Monotonic timestamp in nanoseconds
#[inline(always)]
pub fn now_ns() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Thread group id of the current task
#[inline(always)]
pub fn current_pid() -> u32 {
    (bpf_get_current_pid_tgid() >> 32) as u32
}

/// Increment a per-CPU counter slot
#[inline(always)]
pub fn bump(slot: u32) {
    if let Some(counter) = COUNTERS.get_ptr_mut(slot) {
        unsafe { *counter += 1 };
    }
}

/// Runtime settings, defaults when the daemon wrote nothing
#[inline(always)]
pub fn load_config() -> ProbeConfig {
    CONFIG.get(0).copied().unwrap_or_default()
}

/// Process scoping check for the current task
#[inline(always)]
pub fn in_scope(config: &ProbeConfig, pid: u32) -> bool {
    pid_in_scope(config, pid, |pid| unsafe { TARGET_PIDS.get(&pid).is_some() })
}

/// Apply the sampling stride, then write the event to the perf channel.
///
/// The sampling decision happens before the event is built.
#[inline(always)]
pub fn emit(
    ctx: &ProbeContext,
    config: &ProbeConfig,
    key: ConnectionKey,
    timestamp_ns: u64,
    latency_ns: u64,
    pid: u32,
    kind: u8,
) {
    let admitted = match SAMPLER.get_ptr_mut(0) {
        Some(counter) => admit_sample(unsafe { &mut *counter }, config.sample_stride),
        None => true,
    };
    if !admitted {
        bump(COUNTER_SAMPLED_OUT);
        return;
    }

    let event = LatencyEvent::new(key, timestamp_ns, latency_ns, pid, kind);
    EVENTS.output(ctx, &event, 0);
    bump(COUNTER_EVENTS_EMITTED);
}
