//! Round-trip pairing logic
//!
//! The kernel hooks delegate every decision about the in-flight table to the
//! functions in this module. They only use fixed-cost table operations and no
//! loops, so they are safe to inline into a kprobe, and they are generic over
//! [`InflightTable`] so the same code runs against BPF maps in the kernel and
//! against an in-memory table in host tests.

use crate::types::{ConnectionKey, InflightEntry, ProbeConfig, SocketRecord};

/// Why an insert into the in-flight table did not happen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// An entry already exists for the socket
    Occupied,
    /// The table rejected the update
    Failed,
}

/// Minimal view of the in-flight timing table
pub trait InflightTable {
    fn lookup(&self, sock: u64) -> Option<InflightEntry>;

    /// Insert only when the socket has no entry yet.
    fn insert_new(&mut self, sock: u64, entry: &InflightEntry) -> Result<(), InsertError>;

    /// Insert or overwrite.
    fn replace(&mut self, sock: u64, entry: &InflightEntry) -> Result<(), InsertError>;

    fn remove(&mut self, sock: u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// A new measurement was opened
    Started,
    /// An earlier transmit is still awaiting its receive; left untouched
    AlreadyPending,
    /// The pending entry was stale and has been replaced
    ReplacedStale,
    /// The pending entry belonged to another connection (socket reuse) and has been replaced
    Rekeyed,
    /// The table rejected the update
    Dropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A pending transmit was found and timed
    Matched { key: ConnectionKey, latency_ns: u64 },
    /// No transmit was observed on this socket
    Unmatched,
    /// The pending transmit exceeded the stale threshold
    Stale,
    /// The clock did not advance past the transmit time
    ClockSkew,
}

/// An age strictly above the threshold is stale.
#[inline(always)]
pub fn is_stale(age_ns: u64, threshold_ns: u64) -> bool {
    age_ns > threshold_ns
}

/// Record a transmit on `sock`.
///
/// Only the oldest pending leg of a connection is timed, so an existing fresh
/// entry is kept as is.
#[inline(always)]
pub fn on_transmit<T: InflightTable>(
    table: &mut T,
    sock: u64,
    key: ConnectionKey,
    now_ns: u64,
    threshold_ns: u64,
) -> TransmitOutcome {
    let entry = InflightEntry { start_ns: now_ns, key };

    match table.insert_new(sock, &entry) {
        Ok(()) => TransmitOutcome::Started,
        Err(InsertError::Failed) => TransmitOutcome::Dropped,
        Err(InsertError::Occupied) => {
            let outcome = match table.lookup(sock) {
                Some(pending) if pending.key != key => TransmitOutcome::Rekeyed,
                Some(pending) if is_stale(now_ns.saturating_sub(pending.start_ns), threshold_ns) => {
                    TransmitOutcome::ReplacedStale
                }
                Some(_) => return TransmitOutcome::AlreadyPending,
                // Consumed by a receive between the two lookups
                None => TransmitOutcome::Started,
            };
            match table.replace(sock, &entry) {
                Ok(()) => outcome,
                Err(_) => TransmitOutcome::Dropped,
            }
        }
    }
}

/// Close the measurement pending on `sock`, if any.
///
/// The entry is removed whenever it exists, whatever the outcome, so a
/// completed or discarded round trip never leaves state behind.
#[inline(always)]
pub fn on_receive<T: InflightTable>(
    table: &mut T,
    sock: u64,
    now_ns: u64,
    threshold_ns: u64,
) -> ReceiveOutcome {
    let entry = match table.lookup(sock) {
        Some(entry) => entry,
        None => return ReceiveOutcome::Unmatched,
    };
    table.remove(sock);

    if now_ns <= entry.start_ns {
        return ReceiveOutcome::ClockSkew;
    }
    let latency_ns = now_ns - entry.start_ns;
    if is_stale(latency_ns, threshold_ns) {
        return ReceiveOutcome::Stale;
    }

    ReceiveOutcome::Matched {
        key: entry.key,
        latency_ns,
    }
}

/// Consume the delivery timestamp of a socket record.
///
/// Returns the time between the last receive and now, once per receive.
#[inline(always)]
pub fn on_cleanup(record: &mut SocketRecord, now_ns: u64) -> Option<u64> {
    if record.delivered_ns == 0 || now_ns < record.delivered_ns {
        return None;
    }
    let latency_ns = now_ns - record.delivered_ns;
    record.delivered_ns = 0;
    Some(latency_ns)
}

/// Modulo-counter sampling decision.
///
/// Must be called before the event is built so that overhead follows the
/// sampling rate. With stride N, events N, 2N, 3N... are admitted.
#[inline(always)]
pub fn admit_sample(counter: &mut u64, stride: u32) -> bool {
    if stride <= 1 {
        return true;
    }
    *counter = counter.wrapping_add(1);
    *counter % stride as u64 == 0
}

/// Whether `pid` passes the process scoping filter.
///
/// `contains` is only consulted when the filter is enabled.
#[inline(always)]
pub fn pid_in_scope<F: FnOnce(u32) -> bool>(config: &ProbeConfig, pid: u32, contains: F) -> bool {
    config.filter_pid == 0 || contains(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_STALE_THRESHOLD_NS;
    use std::collections::HashMap;
    use std::vec::Vec;

    const MS: u64 = 1_000_000;

    /// In-memory table with an optional capacity, to mimic a full map
    #[derive(Default)]
    struct MemTable {
        entries: HashMap<u64, InflightEntry>,
        capacity: Option<usize>,
    }

    impl InflightTable for MemTable {
        fn lookup(&self, sock: u64) -> Option<InflightEntry> {
            self.entries.get(&sock).copied()
        }

        fn insert_new(&mut self, sock: u64, entry: &InflightEntry) -> Result<(), InsertError> {
            if self.entries.contains_key(&sock) {
                return Err(InsertError::Occupied);
            }
            self.replace(sock, entry)
        }

        fn replace(&mut self, sock: u64, entry: &InflightEntry) -> Result<(), InsertError> {
            if let Some(cap) = self.capacity {
                if !self.entries.contains_key(&sock) && self.entries.len() >= cap {
                    return Err(InsertError::Failed);
                }
            }
            self.entries.insert(sock, *entry);
            Ok(())
        }

        fn remove(&mut self, sock: u64) {
            self.entries.remove(&sock);
        }
    }

    fn key(port: u16) -> ConnectionKey {
        ConnectionKey::new(0x0100007f, port.to_be(), 0x0100007f, 8080u16.to_be())
    }

    #[test]
    fn test_send_then_receive_emits_once_and_clears_entry() {
        let mut table = MemTable::default();

        assert_eq!(
            on_transmit(&mut table, 0xffff_0001, key(40000), 100 * MS, DEFAULT_STALE_THRESHOLD_NS),
            TransmitOutcome::Started
        );
        assert_eq!(table.entries.len(), 1);

        let outcome = on_receive(&mut table, 0xffff_0001, 103 * MS, DEFAULT_STALE_THRESHOLD_NS);
        assert_eq!(
            outcome,
            ReceiveOutcome::Matched {
                key: key(40000),
                latency_ns: 3 * MS
            }
        );
        assert!(table.entries.is_empty());

        // A second receive has nothing left to pair with
        assert_eq!(
            on_receive(&mut table, 0xffff_0001, 104 * MS, DEFAULT_STALE_THRESHOLD_NS),
            ReceiveOutcome::Unmatched
        );
    }

    #[test]
    fn test_receive_without_transmit_is_unmatched() {
        let mut table = MemTable::default();
        assert_eq!(
            on_receive(&mut table, 42, 5 * MS, DEFAULT_STALE_THRESHOLD_NS),
            ReceiveOutcome::Unmatched
        );
        assert!(table.entries.is_empty());
    }

    #[test]
    fn test_only_oldest_pending_leg_is_timed() {
        let mut table = MemTable::default();
        on_transmit(&mut table, 7, key(1), 10 * MS, DEFAULT_STALE_THRESHOLD_NS);
        assert_eq!(
            on_transmit(&mut table, 7, key(1), 12 * MS, DEFAULT_STALE_THRESHOLD_NS),
            TransmitOutcome::AlreadyPending
        );

        match on_receive(&mut table, 7, 15 * MS, DEFAULT_STALE_THRESHOLD_NS) {
            ReceiveOutcome::Matched { latency_ns, .. } => assert_eq!(latency_ns, 5 * MS),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_stale_entry_is_discarded_on_receive() {
        let mut table = MemTable::default();
        let threshold = DEFAULT_STALE_THRESHOLD_NS;
        on_transmit(&mut table, 9, key(2), 1_000, threshold);

        let outcome = on_receive(&mut table, 9, 1_000 + threshold + 1, threshold);
        assert_eq!(outcome, ReceiveOutcome::Stale);
        assert!(table.entries.is_empty());
    }

    #[test]
    fn test_entry_at_threshold_is_not_stale() {
        let mut table = MemTable::default();
        on_transmit(&mut table, 9, key(2), 1_000, 500);
        assert!(matches!(
            on_receive(&mut table, 9, 1_500, 500),
            ReceiveOutcome::Matched { latency_ns: 500, .. }
        ));
    }

    #[test]
    fn test_stale_pending_entry_is_replaced_on_transmit() {
        let mut table = MemTable::default();
        let threshold = 10 * MS;
        on_transmit(&mut table, 3, key(3), MS, threshold);

        assert_eq!(
            on_transmit(&mut table, 3, key(3), 20 * MS, threshold),
            TransmitOutcome::ReplacedStale
        );
        assert_eq!(table.lookup(3).map(|e| e.start_ns), Some(20 * MS));
    }

    #[test]
    fn test_reused_socket_is_rekeyed() {
        let mut table = MemTable::default();
        on_transmit(&mut table, 3, key(3), MS, DEFAULT_STALE_THRESHOLD_NS);

        assert_eq!(
            on_transmit(&mut table, 3, key(4), 2 * MS, DEFAULT_STALE_THRESHOLD_NS),
            TransmitOutcome::Rekeyed
        );
        assert_eq!(table.lookup(3).map(|e| e.key), Some(key(4)));
    }

    #[test]
    fn test_full_table_drops_silently() {
        let mut table = MemTable {
            capacity: Some(1),
            ..Default::default()
        };
        on_transmit(&mut table, 1, key(1), MS, DEFAULT_STALE_THRESHOLD_NS);
        assert_eq!(
            on_transmit(&mut table, 2, key(2), MS, DEFAULT_STALE_THRESHOLD_NS),
            TransmitOutcome::Dropped
        );
        assert_eq!(table.entries.len(), 1);
    }

    #[test]
    fn test_clock_skew_never_yields_latency() {
        let mut table = MemTable::default();
        on_transmit(&mut table, 5, key(5), 50 * MS, DEFAULT_STALE_THRESHOLD_NS);
        assert_eq!(
            on_receive(&mut table, 5, 40 * MS, DEFAULT_STALE_THRESHOLD_NS),
            ReceiveOutcome::ClockSkew
        );
        assert!(table.entries.is_empty());
    }

    #[test]
    fn test_cleanup_consumes_delivery_once() {
        let mut record = SocketRecord {
            delivered_ns: 10 * MS,
            key: key(6),
        };
        assert_eq!(on_cleanup(&mut record, 11 * MS), Some(MS));
        assert_eq!(record.delivered_ns, 0);
        assert_eq!(on_cleanup(&mut record, 12 * MS), None);
    }

    #[test]
    fn test_sampling_stride() {
        for stride in [1u32, 2, 7, 100] {
            let mut counter = 0u64;
            let total = 10_000u64;
            let admitted = (0..total).filter(|_| admit_sample(&mut counter, stride)).count() as u64;
            let expected = total / stride as u64;
            assert!(
                admitted.abs_diff(expected) <= 1,
                "stride {}: admitted {}, expected {}",
                stride,
                admitted,
                expected
            );
        }
    }

    #[test]
    fn test_sampling_preserves_distribution_shape() {
        // Latencies cycle through 10 values; sampling with a stride coprime to
        // the cycle keeps every value equally represented.
        let latencies: Vec<u64> = (0..10_000u64).map(|i| (i % 10 + 1) * MS).collect();
        let mut counter = 0u64;
        let sampled: Vec<u64> = latencies
            .iter()
            .copied()
            .filter(|_| admit_sample(&mut counter, 3))
            .collect();

        let mean_all = latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
        let mean_sampled = sampled.iter().sum::<u64>() as f64 / sampled.len() as f64;
        assert!((mean_all - mean_sampled).abs() / mean_all < 0.01);
    }

    #[test]
    fn test_pid_scope() {
        let open = ProbeConfig::default();
        assert!(pid_in_scope(&open, 1234, |_| false));

        let scoped = ProbeConfig {
            filter_pid: 1,
            ..Default::default()
        };
        assert!(pid_in_scope(&scoped, 1234, |pid| pid == 1234));
        assert!(!pid_in_scope(&scoped, 99, |pid| pid == 1234));
    }
}
