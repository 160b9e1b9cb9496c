//! TCP Latency Probe Userspace Library
//!
//! Loads and attaches the eBPF latency probe, reads its per-CPU event
//! channel, aggregates round trips and exports the report.

pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod preflight;
pub mod scope;
pub mod shutdown;
pub mod stats;
pub mod types;

pub use collector::{run_aggregator, Aggregator, ReportContext};
pub use config::{Cli, RunConfig};
pub use error::{exit_code_for, ExportError, StartupError};
pub use events::{spawn_cpu_readers, ReaderStats};
pub use exporter::{export_with_retries, ExporterType, MetricsExporter};
pub use loader::ProbeHandle;
pub use shutdown::{wait_for_stop, StopReason, StopSignals};
pub use types::*;
