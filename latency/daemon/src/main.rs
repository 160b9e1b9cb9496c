//! eBPF TCP Latency Probe - Userspace Program
//!
//! Loads the eBPF latency tracking program, attaches kprobes,
//! collects events, and exports the report.
//!
//! ## Usage
//!
//! ```bash
//! # Run for 60 seconds and export to JSON
//! sudo ./latency-probe --duration 60 --output metrics.json
//!
//! # Run with sampling (capture 1 in 100 events)
//! sudo ./latency-probe --duration 60 --sample-rate 100
//!
//! # Only measure one service and its children
//! sudo ./latency-probe --pid 4242
//!
//! # Export to Prometheus format
//! sudo ./latency-probe --duration 60 --format prometheus --output metrics.prom
//! ```

use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use latency_probe::{
    collector::{collect_counters, run_aggregator, Aggregator, ReportContext},
    config::{Cli, RunConfig},
    error::exit_code_for,
    events::{spawn_cpu_readers, ReaderStats},
    exporter::export_with_retries,
    loader::ProbeHandle,
    preflight,
    scope::{run_refresh, ScopeTracker},
    shutdown::{wait_for_stop, StopSignals},
    types::LatencyReport,
};
use log::{error, info, warn};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

/// Capacity of the reader to aggregator channel
const EVENT_CHANNEL_CAPACITY: usize = 8192;

/// How often the process scope is re-read from /proc
const SCOPE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Exit status for command line errors
const EXIT_USAGE: u8 = 64;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "info" },
    ))
    .init();

    let result = match RunConfig::try_from(cli) {
        Ok(config) => run(config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(config: RunConfig) -> Result<()> {
    // Before anything slow, so an early SIGINT or SIGTERM still ends in a report
    let mut signals = StopSignals::install()?;

    print_banner();

    info!("Starting eBPF latency probe...");
    info!(
        "   Duration: {}",
        config
            .duration
            .map(|d| format!("{} seconds", d.as_secs()))
            .unwrap_or_else(|| "until interrupted".to_string())
    );
    info!("   Output: {:?} ({:?})", config.output, config.format);
    info!("   Sample rate: 1 in {}", config.sample_stride);
    if let Some(pid) = config.target_pid {
        info!("   Target pid: {} and descendants", pid);
    }

    if config.skip_preflight {
        warn!("Skipping preflight checks");
    } else {
        preflight::check_host()?;
    }

    let mut probe = ProbeHandle::load(config.ebpf_object.as_deref())?;
    probe.configure(&config.probe_config())?;

    let scope = match config.target_pid {
        Some(pid) => {
            let tracker = ScopeTracker::new(pid, probe.take_target_pids()?)?;
            info!("Scoped to {} processes", tracker.len());
            Some(tracker)
        }
        None => None,
    };

    let mut perf_array = probe.take_event_channel()?;
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reader_stats = Arc::new(ReaderStats::default());

    // Readers are running before the kprobes fire
    let readers = spawn_cpu_readers(&mut perf_array, tx, shutdown_rx.clone(), Arc::clone(&reader_stats))?;
    let aggregator = tokio::spawn(run_aggregator(
        rx,
        Aggregator::new(config.stale_threshold_ns()),
        config.progress_interval,
    ));

    let start_time = Instant::now();
    let scope_task = match signals.pending().await {
        Some(reason) => {
            info!("Stop requested during startup ({:?}), not attaching", reason);
            None
        }
        None => {
            probe.attach()?;
            info!("Collecting metrics...");

            let scope_task = scope.map(|tracker| {
                tokio::spawn(run_refresh(tracker, SCOPE_REFRESH_INTERVAL, shutdown_rx))
            });
            wait_for_stop(signals.recv(), config.duration).await;
            scope_task
        }
    };
    let elapsed = start_time.elapsed().as_secs();

    // No new events once detached; readers then drain what is buffered
    probe.detach();
    let _ = shutdown_tx.send(true);

    if let Some(task) = scope_task {
        let _ = task.await;
    }
    for reader in readers {
        if let Err(e) = reader.await {
            warn!("Event reader task failed: {}", e);
        }
    }
    let aggregator = aggregator.await.context("Aggregator task failed")?;

    let kernel_counters = collect_counters(probe.snapshot(), &reader_stats);
    probe.close();
    drop(perf_array);

    info!("Generating metrics report...");

    let report = aggregator.build_report(ReportContext {
        timestamp: chrono::Utc::now().to_rfc3339(),
        duration_seconds: elapsed,
        kernel_counters,
        config: config.report_config(),
    });

    let exporter = config.format.build(config.output.clone());
    export_with_retries(exporter.as_ref(), &report, config.export_retries).await?;

    print_summary(&report);

    Ok(())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║           eBPF TCP Round-Trip Latency Probe       ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(report: &LatencyReport) {
    let k = &report.kernel_counters;

    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Total events:       {}", report.total_events);
    info!("  Unique connections: {}", report.connections.len());
    info!("  Duration:           {} seconds", report.duration_seconds);
    info!("");
    info!("  Round-trip Percentiles (μs):");
    info!("    p50:  {:>10.2}", report.percentiles.p50);
    info!("    p75:  {:>10.2}", report.percentiles.p75);
    info!("    p90:  {:>10.2}", report.percentiles.p90);
    info!("    p95:  {:>10.2}", report.percentiles.p95);
    info!("    p99:  {:>10.2}", report.percentiles.p99);
    info!("    p999: {:>10.2}", report.percentiles.p999);
    info!("");
    info!("  Histogram:");
    info!("    0-1ms:       {:>8}", report.histogram.bucket_0_1ms);
    info!("    1-5ms:       {:>8}", report.histogram.bucket_1_5ms);
    info!("    5-10ms:      {:>8}", report.histogram.bucket_5_10ms);
    info!("    10-50ms:     {:>8}", report.histogram.bucket_10_50ms);
    info!("    50-100ms:    {:>8}", report.histogram.bucket_50_100ms);
    info!("    100ms+:      {:>8}", report.histogram.bucket_100ms_plus);
    info!("");
    info!("  Hook Hits:");
    info!("    tcp_sendmsg:      {:>8}", report.event_type_breakdown.tcp_sendmsg);
    info!("    tcp_recvmsg:      {:>8}", report.event_type_breakdown.tcp_recvmsg);
    info!("    tcp_cleanup_rbuf: {:>8}", report.event_type_breakdown.tcp_cleanup_rbuf);
    info!("");
    info!("  Dropped:");
    info!("    unmatched:   {:>8}", k.unmatched_receives);
    info!("    stale:       {:>8}", k.stale_discards + k.userspace_stale_discards);
    info!("    map full:    {:>8}", k.map_update_failures);
    info!("    lost:        {:>8}", k.lost_events);
    info!("    sampled out: {:>8}", k.sampled_out);
    info!("");
    info!("============================================");
}
