//! Shared types and logic for the TCP latency probe
//!
//! This crate is compiled twice: once for the bpf target, linked into the
//! kernel program, and once for the host, used by the daemon and by tests.
//! Everything here must stay `no_std` and allocation-free.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod constants;
pub mod tracker;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{ConnectionKey, InflightEntry, LatencyEvent, ProbeConfig, SocketRecord};
