//! Userspace type definitions
//!
//! Typed events decoded from the perf channel, and the report structures
//! that make up the output artifact.
//!
//! ## Organization
//!
//! - **Kernel Types**: re-exported from latency_probe_common, binary compatible with the eBPF program
//! - **Events**: the decoded, typed form the aggregator consumes
//! - **Report**: serialized once per run

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::Ipv4Addr};

use crate::stats::{Percentiles, RunningStats};

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared with the kernel program
    //!
    //! Re-exported from latency-probe-common; their layout must match the
    //! eBPF object.

    pub use latency_probe_common::constants;
    pub use latency_probe_common::types::{ConnectionKey, LatencyEvent, ProbeConfig};
}

pub use kernel::{ConnectionKey, LatencyEvent};

// ============================================================================
// Events
// ============================================================================

/// Hook site an event originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// tcp_sendmsg
    Send,
    /// tcp_recvmsg
    Recv,
    /// tcp_cleanup_rbuf
    Cleanup,
}

impl EventKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            kernel::constants::EVENT_KIND_SEND => Some(EventKind::Send),
            kernel::constants::EVENT_KIND_RECV => Some(EventKind::Recv),
            kernel::constants::EVENT_KIND_CLEANUP => Some(EventKind::Cleanup),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            EventKind::Send => kernel::constants::EVENT_KIND_SEND,
            EventKind::Recv => kernel::constants::EVENT_KIND_RECV,
            EventKind::Cleanup => kernel::constants::EVENT_KIND_CLEANUP,
        }
    }
}

/// A decoded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub connection: ConnectionKey,
    pub kind: EventKind,
    /// Nanoseconds; 0 for send events
    pub latency_ns: u64,
    pub timestamp_ns: u64,
    pub pid: u32,
}

impl Event {
    /// Decode the raw bytes of one perf sample.
    ///
    /// Returns `None` for short samples and unknown kinds.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < std::mem::size_of::<LatencyEvent>() {
            return None;
        }
        let event = unsafe { (raw.as_ptr() as *const LatencyEvent).read_unaligned() };

        Some(Self {
            connection: event.key,
            kind: EventKind::from_raw(event.kind)?,
            latency_ns: event.latency_ns,
            timestamp_ns: event.timestamp_ns,
            pid: event.pid,
        })
    }
}

impl From<Event> for LatencyEvent {
    fn from(event: Event) -> Self {
        LatencyEvent::new(
            event.connection,
            event.timestamp_ns,
            event.latency_ns,
            event.pid,
            event.kind.as_raw(),
        )
    }
}

/// Local side of a connection as "addr:port"
pub fn source_endpoint(key: &ConnectionKey) -> String {
    format!("{}:{}", Ipv4Addr::from(u32::from_be(key.saddr)), u16::from_be(key.sport))
}

/// Remote side of a connection as "addr:port"
pub fn destination_endpoint(key: &ConnectionKey) -> String {
    format!("{}:{}", Ipv4Addr::from(u32::from_be(key.daddr)), u16::from_be(key.dport))
}

/// "saddr:sport -> daddr:dport"
pub fn connection_key_to_string(key: &ConnectionKey) -> String {
    format!("{} -> {}", source_endpoint(key), destination_endpoint(key))
}

// ============================================================================
// Report
// ============================================================================

/// The output artifact, one per run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LatencyReport {
    /// RFC 3339 time the report was generated
    pub timestamp: String,
    pub duration_seconds: u64,
    /// Events consumed from the perf channel, all kinds
    pub total_events: u64,
    /// Per-connection round-trip statistics, keyed by "saddr:sport -> daddr:dport"
    pub connections: BTreeMap<String, ConnectionMetrics>,
    pub histogram: LatencyHistogram,
    pub percentiles: Percentiles,
    /// Hook hits per site, as counted in the kernel before scoping and sampling
    pub event_type_breakdown: EventTypeBreakdown,
    /// Events consumed from the perf channel per kind
    pub events_consumed: EventTypeBreakdown,
    /// Delivery-to-drain time measured at tcp_cleanup_rbuf
    pub delivery: PhaseMetrics,
    pub kernel_counters: KernelCounters,
    pub config: ReportConfig,
}

/// Round-trip statistics for a single connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionMetrics {
    pub source: String,
    pub destination: String,
    pub events: u64,
    pub min_latency_us: f64,
    pub max_latency_us: f64,
    pub avg_latency_us: f64,
    pub std_dev_us: f64,
}

impl ConnectionMetrics {
    pub fn new(key: &ConnectionKey, stats: &RunningStats) -> Self {
        Self {
            source: source_endpoint(key),
            destination: destination_endpoint(key),
            events: stats.count(),
            min_latency_us: stats.min(),
            max_latency_us: stats.max(),
            avg_latency_us: stats.mean(),
            std_dev_us: stats.std_dev(),
        }
    }
}

/// Summary of one timing phase
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PhaseMetrics {
    pub events: u64,
    pub min_latency_us: f64,
    pub max_latency_us: f64,
    pub avg_latency_us: f64,
    pub std_dev_us: f64,
}

impl From<&RunningStats> for PhaseMetrics {
    fn from(stats: &RunningStats) -> Self {
        Self {
            events: stats.count(),
            min_latency_us: stats.min(),
            max_latency_us: stats.max(),
            avg_latency_us: stats.mean(),
            std_dev_us: stats.std_dev(),
        }
    }
}

/// Round-trip latency histogram
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct LatencyHistogram {
    #[serde(rename = "0-1ms")]
    pub bucket_0_1ms: u64,
    #[serde(rename = "1-5ms")]
    pub bucket_1_5ms: u64,
    #[serde(rename = "5-10ms")]
    pub bucket_5_10ms: u64,
    #[serde(rename = "10-50ms")]
    pub bucket_10_50ms: u64,
    #[serde(rename = "50-100ms")]
    pub bucket_50_100ms: u64,
    #[serde(rename = "100ms+")]
    pub bucket_100ms_plus: u64,
}

impl LatencyHistogram {
    /// Add a sample; bucket lower edges are inclusive
    pub fn add_sample(&mut self, latency_us: f64) {
        use kernel::constants::*;

        match latency_us {
            l if l < HISTOGRAM_BUCKET_1MS as f64 => self.bucket_0_1ms += 1,
            l if l < HISTOGRAM_BUCKET_5MS as f64 => self.bucket_1_5ms += 1,
            l if l < HISTOGRAM_BUCKET_10MS as f64 => self.bucket_5_10ms += 1,
            l if l < HISTOGRAM_BUCKET_50MS as f64 => self.bucket_10_50ms += 1,
            l if l < HISTOGRAM_BUCKET_100MS as f64 => self.bucket_50_100ms += 1,
            _ => self.bucket_100ms_plus += 1,
        }
    }

    pub fn total_count(&self) -> u64 {
        self.bucket_0_1ms
            + self.bucket_1_5ms
            + self.bucket_5_10ms
            + self.bucket_10_50ms
            + self.bucket_50_100ms
            + self.bucket_100ms_plus
    }
}

/// Counts per hook site
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct EventTypeBreakdown {
    pub tcp_sendmsg: u64,
    pub tcp_recvmsg: u64,
    pub tcp_cleanup_rbuf: u64,
}

impl From<&KernelCounters> for EventTypeBreakdown {
    fn from(counters: &KernelCounters) -> Self {
        Self {
            tcp_sendmsg: counters.send_observed,
            tcp_recvmsg: counters.recv_observed,
            tcp_cleanup_rbuf: counters.cleanup_observed,
        }
    }
}

/// Degraded-but-continuing conditions and hook activity
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct KernelCounters {
    pub send_observed: u64,
    pub recv_observed: u64,
    pub cleanup_observed: u64,
    pub events_emitted: u64,
    pub unmatched_receives: u64,
    pub stale_discards: u64,
    pub map_update_failures: u64,
    pub sampled_out: u64,
    pub filtered_out: u64,
    pub invalid_sockets: u64,
    /// Samples the perf rings overwrote before userspace read them
    pub lost_events: u64,
    /// Samples that could not be decoded
    pub malformed_events: u64,
    /// Events dropped by the aggregator for exceeding the stale threshold
    pub userspace_stale_discards: u64,
    /// In-flight entries left in the kernel table at shutdown
    pub inflight_remaining: u64,
}

impl KernelCounters {
    /// Build from the per-slot values of the COUNTERS map
    pub fn from_slots(slots: &[u64]) -> Self {
        use kernel::constants::*;

        let slot = |index: u32| slots.get(index as usize).copied().unwrap_or(0);
        Self {
            send_observed: slot(COUNTER_SEND_OBSERVED),
            recv_observed: slot(COUNTER_RECV_OBSERVED),
            cleanup_observed: slot(COUNTER_CLEANUP_OBSERVED),
            events_emitted: slot(COUNTER_EVENTS_EMITTED),
            unmatched_receives: slot(COUNTER_UNMATCHED_RECEIVES),
            stale_discards: slot(COUNTER_STALE_DISCARDS),
            map_update_failures: slot(COUNTER_MAP_UPDATE_FAILURES),
            sampled_out: slot(COUNTER_SAMPLED_OUT),
            filtered_out: slot(COUNTER_FILTERED_OUT),
            invalid_sockets: slot(COUNTER_INVALID_SOCKETS),
            ..Default::default()
        }
    }
}

/// Settings the run was made with
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    pub sample_stride: u32,
    pub target_pid: Option<u32>,
    pub stale_threshold_ms: u64,
    pub trace_sends: bool,
}
