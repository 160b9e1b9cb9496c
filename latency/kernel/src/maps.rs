//! BPF map definitions
//!
//! Socket identities (the `struct sock` address) are only ever used as keys.

use aya_ebpf::{
    bindings::{BPF_ANY, BPF_NOEXIST},
    macros::map,
    maps::{Array, HashMap, LruHashMap, PerCpuArray, PerfEventArray},
};
use latency_probe_common::{
    constants::*,
    tracker::{InflightTable, InsertError},
    types::*,
};

const EEXIST: i64 = 17;

/// Pending transmits awaiting their receive.
///
/// LRU: under pressure the oldest entries are evicted rather than
/// inserts failing.
#[map]
pub static INFLIGHT: LruHashMap<u64, InflightEntry> =
    LruHashMap::with_max_entries(MAX_INFLIGHT, 0);

/// Socket identity to connection identity, plus the last delivery time
#[map]
pub static SOCKETS: LruHashMap<u64, SocketRecord> = LruHashMap::with_max_entries(MAX_INFLIGHT, 0);

/// Per-CPU event channel to userspace
#[map]
pub static EVENTS: PerfEventArray<LatencyEvent> = PerfEventArray::new(0);

/// Named counters, one slot per COUNTER_* constant, summed across CPUs by userspace
#[map]
pub static COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MAX_COUNTERS, 0);

/// Sampling counter, one per CPU so the modulo decision never contends
#[map]
pub static SAMPLER: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// Runtime settings, slot 0, written by the daemon before attach
#[map]
pub static CONFIG: Array<ProbeConfig> = Array::with_max_entries(1, 0);

/// Process scoping set: target pid and its descendants
#[map]
pub static TARGET_PIDS: HashMap<u32, u8> = HashMap::with_max_entries(MAX_TARGET_PIDS, 0);

/// [`InflightTable`] backed by the INFLIGHT map
pub struct KernelInflight;

impl InflightTable for KernelInflight {
    #[inline(always)]
    fn lookup(&self, sock: u64) -> Option<InflightEntry> {
        unsafe { INFLIGHT.get(&sock).copied() }
    }

    #[inline(always)]
    fn insert_new(&mut self, sock: u64, entry: &InflightEntry) -> Result<(), InsertError> {
        INFLIGHT
            .insert(&sock, entry, BPF_NOEXIST as u64)
            .map_err(|err| {
                if err == -EEXIST {
                    InsertError::Occupied
                } else {
                    InsertError::Failed
                }
            })
    }

    #[inline(always)]
    fn replace(&mut self, sock: u64, entry: &InflightEntry) -> Result<(), InsertError> {
        INFLIGHT
            .insert(&sock, entry, BPF_ANY as u64)
            .map_err(|_| InsertError::Failed)
    }

    #[inline(always)]
    fn remove(&mut self, sock: u64) {
        let _ = INFLIGHT.remove(&sock);
    }
}
