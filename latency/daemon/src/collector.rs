//! Metrics aggregation
//!
//! A single [`Aggregator`] owns all statistics; the per-CPU readers only
//! forward decoded events to it over a channel, so there is no shared mutable
//! state between tasks.

use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use log::{info, trace, warn};
use tokio::{sync::mpsc, time::interval_at};

use crate::{
    events::ReaderStats,
    loader::KernelSnapshot,
    stats::{ns_to_us, Percentiles, RunningStats},
    types::*,
};

/// Inputs to a report that do not come from the event stream
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub timestamp: String,
    pub duration_seconds: u64,
    pub kernel_counters: KernelCounters,
    pub config: ReportConfig,
}

/// Folds the event stream into report statistics
#[derive(Debug, Default)]
pub struct Aggregator {
    /// Round-trip samples in ns, kept for exact percentiles
    round_trips: Vec<u64>,
    connections: HashMap<ConnectionKey, RunningStats>,
    delivery: RunningStats,
    histogram: LatencyHistogram,
    event_types: EventTypeBreakdown,
    total_events: u64,
    stale_threshold_ns: u64,
    stale_discards: u64,
}

impl Aggregator {
    /// `stale_threshold_ns` of 0 disables the userspace stale filter
    pub fn new(stale_threshold_ns: u64) -> Self {
        Self {
            stale_threshold_ns,
            ..Default::default()
        }
    }

    /// Add one event
    pub fn apply(&mut self, event: &Event) {
        self.total_events += 1;

        match event.kind {
            EventKind::Send => self.event_types.tcp_sendmsg += 1,
            EventKind::Recv => self.event_types.tcp_recvmsg += 1,
            EventKind::Cleanup => self.event_types.tcp_cleanup_rbuf += 1,
        }

        if event.kind != EventKind::Send
            && self.stale_threshold_ns > 0
            && event.latency_ns > self.stale_threshold_ns
        {
            self.stale_discards += 1;
            trace!(
                "Discarding stale {:?} event on {}: {} ns",
                event.kind,
                connection_key_to_string(&event.connection),
                event.latency_ns
            );
            return;
        }

        let latency_us = ns_to_us(event.latency_ns);
        match event.kind {
            EventKind::Recv => {
                self.round_trips.push(event.latency_ns);
                self.histogram.add_sample(latency_us);
                self.connections
                    .entry(event.connection)
                    .or_default()
                    .push(latency_us);
            }
            EventKind::Cleanup => self.delivery.push(latency_us),
            EventKind::Send => {}
        }
    }

    /// Events consumed so far, all kinds
    pub fn event_count(&self) -> u64 {
        self.total_events
    }

    /// Connections with at least one round trip
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn round_trip_count(&self) -> usize {
        self.round_trips.len()
    }

    /// Events dropped by the userspace stale filter
    pub fn stale_discards(&self) -> u64 {
        self.stale_discards
    }

    pub fn histogram(&self) -> &LatencyHistogram {
        &self.histogram
    }

    /// Build the report. Pure with respect to the aggregated events.
    pub fn build_report(&self, context: ReportContext) -> LatencyReport {
        let mut sorted = self.round_trips.clone();
        sorted.sort_unstable();

        let connections = self
            .connections
            .iter()
            .map(|(key, stats)| (connection_key_to_string(key), ConnectionMetrics::new(key, stats)))
            .collect();

        let mut kernel_counters = context.kernel_counters;
        kernel_counters.userspace_stale_discards = self.stale_discards;

        LatencyReport {
            timestamp: context.timestamp,
            duration_seconds: context.duration_seconds,
            total_events: self.total_events,
            connections,
            histogram: self.histogram.clone(),
            percentiles: Percentiles::from_sorted_ns(&sorted),
            event_type_breakdown: EventTypeBreakdown::from(&kernel_counters),
            events_consumed: self.event_types.clone(),
            delivery: PhaseMetrics::from(&self.delivery),
            kernel_counters,
            config: context.config,
        }
    }
}

/// Counters for the report. A failed kernel read is reported as zeros so the
/// measurements themselves still get exported.
pub fn collect_counters(snapshot: Result<KernelSnapshot>, readers: &ReaderStats) -> KernelCounters {
    let snapshot = snapshot.unwrap_or_else(|e| {
        warn!("Failed to read kernel counters, reporting zeros: {:#}", e);
        KernelSnapshot::default()
    });

    let mut counters = KernelCounters::from_slots(&snapshot.counters);
    counters.inflight_remaining = snapshot.inflight_remaining;
    counters.lost_events = readers.lost();
    counters.malformed_events = readers.malformed();
    counters
}

/// Consume events until every sender is dropped, then hand back the aggregate.
///
/// With `progress` set, a progress line is logged at that interval.
pub async fn run_aggregator(
    mut rx: mpsc::Receiver<Event>,
    mut aggregator: Aggregator,
    progress: Option<Duration>,
) -> Aggregator {
    let period = progress.unwrap_or(Duration::from_secs(3600));
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => aggregator.apply(&event),
                None => break,
            },
            _ = ticker.tick(), if progress.is_some() => {
                info!(
                    "📈 Progress: {} events collected, {} unique connections",
                    aggregator.event_count(),
                    aggregator.connection_count()
                );
            }
        }
    }

    aggregator
}
