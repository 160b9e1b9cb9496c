//! Event processing from eBPF perf buffers
//!
//! One task per CPU reads its perf ring, decodes samples and forwards them to
//! the aggregator over a bounded channel. On shutdown each reader keeps
//! draining its ring until it has been idle for [`DRAIN_IDLE`], so events
//! already produced by the kernel still make it into the report.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use aya::{
    maps::{
        perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer},
        MapData,
    },
    util::online_cpus,
};
use bytes::BytesMut;
use latency_probe_common::constants::PERF_PAGES_PER_CPU;
use log::{debug, info, trace, warn};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::types::{connection_key_to_string, Event, LatencyEvent};

/// A reader stops draining after this long without new samples
pub const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// Samples fetched per read
const BATCH_SIZE: usize = 16;

/// Back-off after a failed read
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Counters shared by all readers
#[derive(Debug, Default)]
pub struct ReaderStats {
    /// Samples overwritten in the ring before they were read
    pub lost: AtomicU64,
    /// Samples too short or of unknown kind
    pub malformed: AtomicU64,
}

impl ReaderStats {
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// A per-CPU stream of raw samples
pub trait RawEventSource: Send + 'static {
    /// Fill `buffers` with the next samples; returns `(read, lost)`
    fn read_batch(
        &mut self,
        buffers: &mut [BytesMut],
    ) -> impl Future<Output = Result<(usize, usize)>> + Send;
}

impl RawEventSource for AsyncPerfEventArrayBuffer<MapData> {
    async fn read_batch(&mut self, buffers: &mut [BytesMut]) -> Result<(usize, usize)> {
        let events = self.read_events(buffers).await?;
        Ok((events.read, events.lost))
    }
}

/// Spawn one reader task per online CPU
pub fn spawn_cpu_readers(
    perf_array: &mut AsyncPerfEventArray<MapData>,
    tx: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<ReaderStats>,
) -> Result<Vec<JoinHandle<()>>> {
    let cpus = online_cpus()?;
    info!("Spawning event readers for {} CPUs", cpus.len());

    let mut handles = Vec::with_capacity(cpus.len());
    for cpu_id in cpus {
        let buf = perf_array.open(cpu_id, Some(PERF_PAGES_PER_CPU))?;
        handles.push(tokio::spawn(read_loop(
            cpu_id,
            buf,
            tx.clone(),
            shutdown.clone(),
            Arc::clone(&stats),
        )));
    }

    Ok(handles)
}

fn is_stopped(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Read `source` until shutdown, then drain it
pub async fn read_loop<S: RawEventSource>(
    cpu_id: u32,
    mut source: S,
    tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<ReaderStats>,
) {
    let mut buffers = (0..BATCH_SIZE)
        .map(|_| BytesMut::with_capacity(std::mem::size_of::<LatencyEvent>()))
        .collect::<Vec<_>>();

    while !is_stopped(&shutdown) {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            batch = source.read_batch(&mut buffers) => match batch {
                Ok((read, lost)) => {
                    if !forward(cpu_id, &buffers[..read], lost, &tx, &stats).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Error reading events from CPU {}: {}", cpu_id, e);
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
    }

    let mut drained = 0usize;
    loop {
        match tokio::time::timeout(DRAIN_IDLE, source.read_batch(&mut buffers)).await {
            Ok(Ok((read, lost))) => {
                drained += read;
                if !forward(cpu_id, &buffers[..read], lost, &tx, &stats).await {
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!("Error draining CPU {}: {}", cpu_id, e);
                break;
            }
            Err(_) => break,
        }
    }
    debug!("Reader for CPU {} stopped, {} events drained", cpu_id, drained);
}

/// Decode and send a batch. Returns false once the aggregator is gone.
async fn forward(
    cpu_id: u32,
    samples: &[BytesMut],
    lost: usize,
    tx: &mpsc::Sender<Event>,
    stats: &ReaderStats,
) -> bool {
    if lost > 0 {
        stats.lost.fetch_add(lost as u64, Ordering::Relaxed);
        debug!("CPU {} lost {} events", cpu_id, lost);
    }

    for raw in samples {
        let Some(event) = Event::decode(raw) else {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        trace!(
            "CPU {}: {:?} {} latency {:.2}µs pid {}",
            cpu_id,
            event.kind,
            connection_key_to_string(&event.connection),
            event.latency_ns as f64 / 1000.0,
            event.pid
        );

        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::{run_aggregator, Aggregator, ReportContext},
        types::{ConnectionKey, EventKind, KernelCounters, ReportConfig},
    };
    use latency_probe_common::constants::{DEFAULT_STALE_THRESHOLD_NS, EVENT_KIND_RECV};
    use std::collections::VecDeque;

    /// Serves queued batches, then blocks forever like an idle ring
    struct FakeRing {
        batches: VecDeque<(Vec<Vec<u8>>, usize)>,
    }

    impl RawEventSource for FakeRing {
        async fn read_batch(&mut self, buffers: &mut [BytesMut]) -> Result<(usize, usize)> {
            match self.batches.pop_front() {
                Some((samples, lost)) => {
                    let read = samples.len().min(buffers.len());
                    for (buf, raw) in buffers.iter_mut().zip(&samples) {
                        buf.clear();
                        buf.extend_from_slice(raw);
                    }
                    Ok((read, lost))
                }
                None => std::future::pending().await,
            }
        }
    }

    fn raw_recv(latency_ns: u64) -> Vec<u8> {
        let event = LatencyEvent::new(
            ConnectionKey::new(0x0100007f, 0x409c, 0x0200007f, 0x901f),
            latency_ns,
            latency_ns,
            1234,
            EVENT_KIND_RECV,
        );
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &event as *const LatencyEvent as *const u8,
                std::mem::size_of::<LatencyEvent>(),
            )
        };
        bytes.to_vec()
    }

    #[tokio::test]
    async fn test_reader_drains_after_shutdown() {
        let ring = FakeRing {
            batches: VecDeque::from([
                (vec![raw_recv(1_000), raw_recv(2_000)], 0),
                (vec![raw_recv(3_000), vec![0u8; 4]], 5),
                (vec![raw_recv(4_000)], 0),
            ]),
        };
        let (tx, mut rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(ReaderStats::default());

        shutdown_tx.send(true).unwrap();
        let reader = tokio::spawn(read_loop(0, ring, tx, shutdown_rx, Arc::clone(&stats)));
        reader.await.unwrap();

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event.latency_ns);
        }
        assert_eq!(received, vec![1_000, 2_000, 3_000, 4_000]);
        assert_eq!(stats.lost(), 5);
        assert_eq!(stats.malformed(), 1);
    }

    #[tokio::test]
    async fn test_reader_stops_when_idle_ring_is_shut_down() {
        let ring = FakeRing {
            batches: VecDeque::new(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(ReaderStats::default());

        let reader = tokio::spawn(read_loop(3, ring, tx, shutdown_rx, stats));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader should stop")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_immediate_cancellation_yields_empty_report() {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aggregator = tokio::spawn(run_aggregator(
            rx,
            Aggregator::new(DEFAULT_STALE_THRESHOLD_NS),
            None,
        ));
        let reader = tokio::spawn(read_loop(
            0,
            FakeRing {
                batches: VecDeque::new(),
            },
            tx,
            shutdown_rx,
            Arc::new(ReaderStats::default()),
        ));

        shutdown_tx.send(true).unwrap();
        reader.await.unwrap();
        let aggregator = aggregator.await.unwrap();

        let report = aggregator.build_report(ReportContext {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            duration_seconds: 0,
            kernel_counters: KernelCounters::default(),
            config: ReportConfig::default(),
        });
        assert_eq!(report.total_events, 0);
        assert!(report.connections.is_empty());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["histogram"]["100ms+"], 0);
        assert_eq!(json["event_type_breakdown"]["tcp_recvmsg"], 0);
    }

    #[test]
    fn test_event_kind_of_raw_sample() {
        let event = Event::decode(&raw_recv(5)).unwrap();
        assert_eq!(event.kind, EventKind::Recv);
    }
}
