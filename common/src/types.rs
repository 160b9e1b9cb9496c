//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) with explicit padding so the layout is
//! identical on both sides and the verifier never sees uninitialized bytes.

/// Connection identity (4-tuple plus address family)
///
/// Addresses and ports are in network byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Local IPv4 address
    pub saddr: u32,
    /// Remote IPv4 address
    pub daddr: u32,
    /// Local port
    pub sport: u16,
    /// Remote port
    pub dport: u16,
    /// Address family (AF_INET)
    pub family: u16,
    pub _pad: u16,
}

/// Value of the in-flight timing table, keyed by socket identity
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InflightEntry {
    /// Monotonic time of the transmit that opened the measurement
    pub start_ns: u64,
    /// Connection the socket belonged to at transmit time
    pub key: ConnectionKey,
}

/// Value of the socket identity table, keyed by socket identity
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketRecord {
    /// Time of the last receive on this socket, 0 once consumed by cleanup
    pub delivered_ns: u64,
    pub key: ConnectionKey,
}

/// Event written to the perf channel
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatencyEvent {
    /// Capture time (monotonic, nanoseconds)
    pub timestamp_ns: u64,
    /// Measured latency in nanoseconds, 0 for send events
    pub latency_ns: u64,
    pub key: ConnectionKey,
    /// Thread group id of the process that hit the hook
    pub pid: u32,
    /// One of the EVENT_KIND_* constants
    pub kind: u8,
    pub _pad: [u8; 3],
}

/// Runtime settings written by the daemon into the CONFIG map before attach
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub stale_threshold_ns: u64,
    /// Emit every Nth eligible event (0 and 1 both mean every event)
    pub sample_stride: u32,
    /// Non-zero when emission is restricted to the TARGET_PIDS set
    pub filter_pid: u32,
    /// FLAG_* bits
    pub flags: u32,
    pub _pad: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ns: crate::constants::DEFAULT_STALE_THRESHOLD_NS,
            sample_stride: crate::constants::DEFAULT_SAMPLE_STRIDE,
            filter_pid: 0,
            flags: 0,
            _pad: 0,
        }
    }
}

impl ConnectionKey {
    pub const fn new(saddr: u32, sport: u16, daddr: u32, dport: u16) -> Self {
        Self {
            saddr,
            daddr,
            sport,
            dport,
            family: crate::constants::AF_INET,
            _pad: 0,
        }
    }
}

impl LatencyEvent {
    pub const fn new(key: ConnectionKey, timestamp_ns: u64, latency_ns: u64, pid: u32, kind: u8) -> Self {
        Self {
            timestamp_ns,
            latency_ns,
            key,
            pid,
            kind,
            _pad: [0; 3],
        }
    }
}

// Layouts must have no implicit padding anywhere
const _: () = {
    use core::mem::size_of;
    assert!(size_of::<ConnectionKey>() == 16);
    assert!(size_of::<InflightEntry>() == 24);
    assert!(size_of::<SocketRecord>() == 24);
    assert!(size_of::<LatencyEvent>() == 40);
    assert!(size_of::<ProbeConfig>() == 24);
};

#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for ConnectionKey {}
    unsafe impl aya::Pod for InflightEntry {}
    unsafe impl aya::Pod for SocketRecord {}
    unsafe impl aya::Pod for LatencyEvent {}
    unsafe impl aya::Pod for ProbeConfig {}
}
