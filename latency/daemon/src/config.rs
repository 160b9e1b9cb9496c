//! Command line and environment configuration

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use latency_probe_common::{
    constants::{FLAG_EMIT_SEND, MAX_SAMPLE_STRIDE},
    types::ProbeConfig,
};

use crate::{error::StartupError, exporter::ExporterType, types::ReportConfig};

/// Upper bound for --stale-threshold-secs, one day
pub const MAX_STALE_THRESHOLD_SECS: u64 = 86_400;

/// TCP round-trip latency probe using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Duration to run the probe (in seconds, 0 = until interrupted)
    #[clap(short, long, env = "LATENCY_PROBE_DURATION", default_value_t = 60)]
    pub duration: u64,

    /// Output file for the report
    #[clap(
        short,
        long,
        env = "LATENCY_PROBE_OUTPUT",
        default_value = "latency-metrics.json"
    )]
    pub output: PathBuf,

    /// Output format (json, prometheus, influx)
    #[clap(short, long, env = "LATENCY_PROBE_FORMAT", default_value = "json")]
    pub format: ExporterType,

    /// Sampling stride (1 = capture all, 100 = capture 1 in 100)
    #[clap(short, long, env = "LATENCY_PROBE_SAMPLE_RATE", default_value_t = 1)]
    pub sample_rate: u32,

    /// Only measure this process and its descendants
    #[clap(short, long, env = "LATENCY_PROBE_PID")]
    pub pid: Option<u32>,

    /// Also emit an event for every timed transmit
    #[clap(long, env = "LATENCY_PROBE_TRACE_SENDS")]
    pub trace_sends: bool,

    /// Discard round trips older than this many seconds
    #[clap(long, env = "LATENCY_PROBE_STALE_THRESHOLD_SECS", default_value_t = 60)]
    pub stale_threshold_secs: u64,

    /// Path to eBPF object file (if not embedded)
    #[clap(long, env = "LATENCY_PROBE_EBPF_OBJECT")]
    pub ebpf_object: Option<PathBuf>,

    /// Progress reporting interval in seconds (0 = off)
    #[clap(long, env = "LATENCY_PROBE_PROGRESS_INTERVAL", default_value_t = 10)]
    pub progress_interval: u64,

    /// Extra attempts when writing the report fails
    #[clap(long, env = "LATENCY_PROBE_EXPORT_RETRIES", default_value_t = 2)]
    pub export_retries: u32,

    /// Skip kernel, BTF and capability checks
    #[clap(long, env = "LATENCY_PROBE_SKIP_PREFLIGHT")]
    pub skip_preflight: bool,

    /// Verbose logging
    #[clap(short, long, env = "LATENCY_PROBE_VERBOSE")]
    pub verbose: bool,
}

/// Validated settings for one run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// `None` runs until a signal arrives
    pub duration: Option<Duration>,
    pub output: PathBuf,
    pub format: ExporterType,
    pub sample_stride: u32,
    pub target_pid: Option<u32>,
    pub trace_sends: bool,
    pub stale_threshold: Duration,
    pub ebpf_object: Option<PathBuf>,
    pub progress_interval: Option<Duration>,
    pub export_retries: u32,
    pub skip_preflight: bool,
    pub verbose: bool,
}

impl TryFrom<Cli> for RunConfig {
    type Error = StartupError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if !(1..=MAX_SAMPLE_STRIDE).contains(&cli.sample_rate) {
            return Err(StartupError::InvalidArgument(format!(
                "sample rate must be between 1 and {}, got {}",
                MAX_SAMPLE_STRIDE, cli.sample_rate
            )));
        }
        if !(1..=MAX_STALE_THRESHOLD_SECS).contains(&cli.stale_threshold_secs) {
            return Err(StartupError::InvalidArgument(format!(
                "stale threshold must be between 1 and {} seconds, got {}",
                MAX_STALE_THRESHOLD_SECS, cli.stale_threshold_secs
            )));
        }
        if cli.pid == Some(0) {
            return Err(StartupError::InvalidArgument(
                "pid 0 cannot be targeted".to_string(),
            ));
        }

        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Ok(Self {
            duration: secs(cli.duration),
            output: cli.output,
            format: cli.format,
            sample_stride: cli.sample_rate,
            target_pid: cli.pid,
            trace_sends: cli.trace_sends,
            stale_threshold: Duration::from_secs(cli.stale_threshold_secs),
            ebpf_object: cli.ebpf_object,
            progress_interval: secs(cli.progress_interval),
            export_retries: cli.export_retries,
            skip_preflight: cli.skip_preflight,
            verbose: cli.verbose,
        })
    }
}

impl RunConfig {
    pub fn stale_threshold_ns(&self) -> u64 {
        u64::try_from(self.stale_threshold.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Settings written to the kernel CONFIG map
    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            stale_threshold_ns: self.stale_threshold_ns(),
            sample_stride: self.sample_stride,
            filter_pid: self.target_pid.unwrap_or(0),
            flags: if self.trace_sends { FLAG_EMIT_SEND } else { 0 },
            ..Default::default()
        }
    }

    pub fn report_config(&self) -> ReportConfig {
        ReportConfig {
            sample_stride: self.sample_stride,
            target_pid: self.target_pid,
            stale_threshold_ms: self.stale_threshold.as_millis() as u64,
            trace_sends: self.trace_sends,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RunConfig, StartupError> {
        let cli = Cli::try_parse_from(std::iter::once("latency-probe").chain(args.iter().copied()))
            .expect("arguments should parse");
        RunConfig::try_from(cli)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.duration, Some(Duration::from_secs(60)));
        assert_eq!(config.output, PathBuf::from("latency-metrics.json"));
        assert_eq!(config.format, ExporterType::Json);
        assert_eq!(config.progress_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.export_retries, 2);

        let probe = config.probe_config();
        assert_eq!(probe.sample_stride, 1);
        assert_eq!(probe.filter_pid, 0);
        assert_eq!(probe.flags, 0);
        assert_eq!(probe.stale_threshold_ns, 60_000_000_000);
    }

    #[test]
    fn test_zero_duration_runs_until_signal() {
        let config = parse(&["--duration", "0", "--progress-interval", "0"]).unwrap();
        assert_eq!(config.duration, None);
        assert_eq!(config.progress_interval, None);
    }

    #[test]
    fn test_probe_settings() {
        let config = parse(&[
            "--sample-rate",
            "100",
            "--pid",
            "4242",
            "--trace-sends",
            "--stale-threshold-secs",
            "5",
            "--format",
            "prom",
        ])
        .unwrap();

        let probe = config.probe_config();
        assert_eq!(probe.sample_stride, 100);
        assert_eq!(probe.filter_pid, 4242);
        assert_eq!(probe.flags & FLAG_EMIT_SEND, FLAG_EMIT_SEND);
        assert_eq!(probe.stale_threshold_ns, 5_000_000_000);
        assert_eq!(config.format, ExporterType::Prometheus);
        assert_eq!(config.report_config().stale_threshold_ms, 5_000);
    }

    #[test]
    fn test_sample_rate_bounds() {
        for bad in ["0", "1001"] {
            let err = parse(&["--sample-rate", bad]).unwrap_err();
            assert!(matches!(err, StartupError::InvalidArgument(_)));
            assert_eq!(err.exit_code(), 64);
        }
        assert!(parse(&["--sample-rate", "1000"]).is_ok());
    }

    #[test]
    fn test_rejects_pid_zero_and_zero_threshold() {
        assert!(parse(&["--pid", "0"]).is_err());
        assert!(parse(&["--stale-threshold-secs", "0"]).is_err());
    }

    #[test]
    fn test_stale_threshold_upper_bound() {
        // Would wrap to a few hundred milliseconds if converted unchecked
        let err = parse(&["--stale-threshold-secs", "18446744074"]).unwrap_err();
        assert!(matches!(err, StartupError::InvalidArgument(_)));
        assert_eq!(err.exit_code(), 64);
        assert!(parse(&["--stale-threshold-secs", "86401"]).is_err());

        let config = parse(&["--stale-threshold-secs", "86400"]).unwrap();
        assert_eq!(config.probe_config().stale_threshold_ns, 86_400_000_000_000);
    }

    #[test]
    fn test_threshold_conversion_saturates() {
        let mut config = parse(&[]).unwrap();
        config.stale_threshold = Duration::from_secs(u64::MAX);
        assert_eq!(config.stale_threshold_ns(), u64::MAX);
    }

    #[test]
    fn test_unknown_format_is_a_parse_error() {
        assert!(Cli::try_parse_from(["latency-probe", "--format", "csv"]).is_err());
    }
}
