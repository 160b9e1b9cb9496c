//! Shared constants for the latency probe
//!
//! Used by both the kernel program and the daemon so map sizes, event kinds
//! and counter slots agree on both sides of the boundary.

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Capacity of the in-flight timing table and the socket identity table
pub const MAX_INFLIGHT: u32 = 10240;

/// Capacity of the process scoping set (target pid plus descendants)
pub const MAX_TARGET_PIDS: u32 = 1024;

/// Pages per CPU for each perf ring opened by the daemon
pub const PERF_PAGES_PER_CPU: usize = 64;

// ============================================================================
// Event Kinds (for LatencyEvent.kind)
// ============================================================================

/// Outbound transmission observed in tcp_sendmsg
pub const EVENT_KIND_SEND: u8 = 0;

/// Inbound delivery observed in tcp_recvmsg, carries round-trip latency
pub const EVENT_KIND_RECV: u8 = 1;

/// Receive buffer drained in tcp_cleanup_rbuf, carries delivery latency
pub const EVENT_KIND_CLEANUP: u8 = 2;

// ============================================================================
// Latency Thresholds
// ============================================================================

/// Age past which an in-flight entry is stale (60 seconds in nanoseconds)
pub const DEFAULT_STALE_THRESHOLD_NS: u64 = 60_000_000_000;

// ============================================================================
// Histogram Bucket Edges (in microseconds)
// ============================================================================

pub const HISTOGRAM_BUCKET_1MS: u64 = 1_000;
pub const HISTOGRAM_BUCKET_5MS: u64 = 5_000;
pub const HISTOGRAM_BUCKET_10MS: u64 = 10_000;
pub const HISTOGRAM_BUCKET_50MS: u64 = 50_000;
pub const HISTOGRAM_BUCKET_100MS: u64 = 100_000;

// ============================================================================
// Sampling
// ============================================================================

/// Default sampling stride (1 = emit every event)
pub const DEFAULT_SAMPLE_STRIDE: u32 = 1;

/// Largest accepted sampling stride
pub const MAX_SAMPLE_STRIDE: u32 = 1000;

// ============================================================================
// ProbeConfig.flags bits
// ============================================================================

/// Emit an event for every admitted transmit, not only for round trips
pub const FLAG_EMIT_SEND: u32 = 1 << 0;

// ============================================================================
// Counter Slots (for the per-CPU COUNTERS map)
// ============================================================================

/// tcp_sendmsg invocations
pub const COUNTER_SEND_OBSERVED: u32 = 0;

/// tcp_recvmsg invocations
pub const COUNTER_RECV_OBSERVED: u32 = 1;

/// tcp_cleanup_rbuf invocations
pub const COUNTER_CLEANUP_OBSERVED: u32 = 2;

/// Events written to the perf channel
pub const COUNTER_EVENTS_EMITTED: u32 = 3;

/// Receives with no pending transmit on the socket
pub const COUNTER_UNMATCHED_RECEIVES: u32 = 4;

/// In-flight entries discarded for exceeding the stale threshold
pub const COUNTER_STALE_DISCARDS: u32 = 5;

/// Map updates rejected by the kernel
pub const COUNTER_MAP_UPDATE_FAILURES: u32 = 6;

/// Eligible events skipped by the sampling stride
pub const COUNTER_SAMPLED_OUT: u32 = 7;

/// Hook invocations from processes outside the scoping set
pub const COUNTER_FILTERED_OUT: u32 = 8;

/// Sockets that could not be read or are not IPv4
pub const COUNTER_INVALID_SOCKETS: u32 = 9;

/// Number of counter slots
pub const MAX_COUNTERS: u32 = 10;

// ============================================================================
// Socket constants (from linux/socket.h)
// ============================================================================

/// IPv4 address family
pub const AF_INET: u16 = 2;
