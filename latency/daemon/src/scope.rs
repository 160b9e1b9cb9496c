//! Process scoping
//!
//! The kernel program only checks membership of the current tgid in the
//! TARGET_PIDS map; this module decides what goes into it: the target pid and
//! every descendant visible in /proc, refreshed while the probe runs.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use anyhow::{Context, Result};
use aya::maps::{HashMap as BpfHashMap, MapData};
use latency_probe_common::constants::MAX_TARGET_PIDS;
use log::{debug, warn};
use tokio::sync::watch;

use crate::error::StartupError;

/// Destination of the scoping set
pub trait PidSet: Send + 'static {
    fn add(&mut self, pid: u32) -> Result<()>;
    fn remove(&mut self, pid: u32);
}

impl PidSet for BpfHashMap<MapData, u32, u8> {
    fn add(&mut self, pid: u32) -> Result<()> {
        self.insert(pid, 1, 0)?;
        Ok(())
    }

    fn remove(&mut self, pid: u32) {
        let _ = BpfHashMap::remove(self, &pid);
    }
}

/// `(pid, parent pid)` for every process currently visible in /proc
pub fn process_table() -> Result<Vec<(u32, u32)>> {
    let processes = procfs::process::all_processes().context("Failed to list /proc")?;

    // Processes may exit while we walk /proc
    Ok(processes
        .filter_map(|process| process.ok())
        .filter_map(|process| process.stat().ok())
        .filter(|stat| stat.pid > 0)
        .map(|stat| (stat.pid as u32, stat.ppid.max(0) as u32))
        .collect())
}

/// `root` followed by all of its descendants, breadth first, at most `limit` pids
pub fn process_tree(root: u32, table: &[(u32, u32)], limit: usize) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in table {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut tree = vec![root];
    let mut seen = HashSet::from([root]);
    let mut cursor = 0;
    while cursor < tree.len() && tree.len() < limit {
        if let Some(kids) = children.get(&tree[cursor]) {
            for &kid in kids {
                if tree.len() >= limit {
                    break;
                }
                if seen.insert(kid) {
                    tree.push(kid);
                }
            }
        }
        cursor += 1;
    }
    tree
}

/// Keeps the TARGET_PIDS map in sync with the target's process tree
pub struct ScopeTracker<M: PidSet = BpfHashMap<MapData, u32, u8>> {
    root: u32,
    map: M,
    current: HashSet<u32>,
}

impl<M: PidSet> ScopeTracker<M> {
    /// Populate the map for the first time. Fails if `root` does not exist.
    pub fn new(root: u32, map: M) -> Result<Self> {
        let table = process_table()?;
        if !table.iter().any(|&(pid, _)| pid == root) {
            return Err(StartupError::ProcessNotFound(root).into());
        }

        let mut tracker = Self {
            root,
            map,
            current: HashSet::new(),
        };
        tracker.apply(&table);
        Ok(tracker)
    }

    /// Re-read /proc and update the map
    pub fn refresh(&mut self) {
        match process_table() {
            Ok(table) => self.apply(&table),
            Err(e) => warn!("Failed to refresh process scope: {:#}", e),
        }
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    fn apply(&mut self, table: &[(u32, u32)]) {
        let wanted: HashSet<u32> = process_tree(self.root, table, MAX_TARGET_PIDS as usize)
            .into_iter()
            .collect();

        for pid in self.current.difference(&wanted) {
            self.map.remove(*pid);
        }
        for pid in wanted.difference(&self.current) {
            if let Err(e) = self.map.add(*pid) {
                warn!("Failed to add pid {} to scope: {}", pid, e);
            }
        }

        if wanted != self.current {
            debug!("Process scope for {}: {} pids", self.root, wanted.len());
        }
        self.current = wanted;
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.current.contains(&pid)
    }
}

/// Refresh `tracker` every `period` until `shutdown` flips, then hand it back.
///
/// Walking /proc blocks, so each refresh runs on the blocking pool.
pub async fn run_refresh<M: PidSet>(
    mut tracker: ScopeTracker<M>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<ScopeTracker<M>> {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tokio::task::spawn_blocking(move || {
                    tracker.refresh();
                    tracker
                })
                .await
                {
                    Ok(refreshed) => tracker = refreshed,
                    Err(e) => {
                        warn!("Process scope refresh failed: {}", e);
                        return None;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    Some(tracker)
}
