//! Metrics exporters
//!
//! Renders the report as JSON, Prometheus text or InfluxDB line protocol and
//! writes it atomically: the report is written to a temporary file next to
//! the destination and renamed into place, so a failed run never leaves a
//! truncated report behind.

use std::{
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use log::{info, warn};
use tempfile::NamedTempFile;

use crate::{error::ExportError, types::LatencyReport};

/// Delay between failed export attempts
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Trait for metrics exporters
pub trait MetricsExporter: Send + Sync {
    /// Serialize the report
    fn render(&self, report: &LatencyReport) -> Result<String>;

    /// Destination path
    fn output_path(&self) -> &Path;

    /// Render and atomically replace the destination
    fn export(&self, report: &LatencyReport) -> Result<()> {
        let body = self.render(report)?;
        write_atomically(self.output_path(), body.as_bytes())
    }
}

/// Write `data` to a sibling temporary file and rename it over `path`
pub fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut file = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {:?}", parent))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write report for {:?}", path))?;
    file.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync report for {:?}", path))?;
    file.persist(path)
        .with_context(|| format!("Failed to move report into place at {:?}", path))?;
    Ok(())
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus format
    Prometheus,
    /// InfluxDB line protocol
    Influx,
}

impl FromStr for ExporterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExporterType::Json),
            "prometheus" | "prom" => Ok(ExporterType::Prometheus),
            "influx" | "influxdb" => Ok(ExporterType::Influx),
            other => Err(format!(
                "unknown format '{}', expected json, prometheus or influx",
                other
            )),
        }
    }
}

impl ExporterType {
    /// Build the exporter writing to `output_path`
    pub fn build(self, output_path: PathBuf) -> Box<dyn MetricsExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
            ExporterType::Influx => {
                Box::new(InfluxExporter::new(output_path, "tcp_latency".to_string()))
            }
        }
    }
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn render(&self, report: &LatencyReport) -> Result<String> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        Ok(json)
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn metric(output: &mut String, name: &str, kind: &str, help: &str, samples: &[(String, String)]) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        for (labels, value) in samples {
            output.push_str(&format!("{}{} {}\n", name, labels, value));
        }
        output.push('\n');
    }

    /// Convert the report to Prometheus text format
    fn to_prometheus_format(report: &LatencyReport) -> String {
        let mut output = String::new();
        let plain = |value: String| vec![(String::new(), value)];

        Self::metric(
            &mut output,
            "tcp_latency_events_total",
            "counter",
            "Total number of latency events",
            &plain(report.total_events.to_string()),
        );
        Self::metric(
            &mut output,
            "tcp_latency_duration_seconds",
            "gauge",
            "Duration of collection period",
            &plain(report.duration_seconds.to_string()),
        );

        let p = &report.percentiles;
        Self::metric(
            &mut output,
            "tcp_latency_round_trip_microseconds",
            "gauge",
            "Round-trip latency percentiles in microseconds",
            &[("0.5", p.p50), ("0.75", p.p75), ("0.9", p.p90), ("0.95", p.p95), ("0.99", p.p99), ("0.999", p.p999)]
                .map(|(q, v)| (format!("{{quantile=\"{}\"}}", q), v.to_string())),
        );

        // Cumulative, as Prometheus histograms are
        let h = &report.histogram;
        let mut cumulative = 0;
        let buckets = [
            ("1000", h.bucket_0_1ms),
            ("5000", h.bucket_1_5ms),
            ("10000", h.bucket_5_10ms),
            ("50000", h.bucket_10_50ms),
            ("100000", h.bucket_50_100ms),
            ("+Inf", h.bucket_100ms_plus),
        ]
        .map(|(le, count)| {
            cumulative += count;
            (format!("{{le=\"{}\"}}", le), cumulative.to_string())
        });
        Self::metric(
            &mut output,
            "tcp_latency_round_trip_bucket",
            "counter",
            "Round-trip latency histogram, upper bounds in microseconds",
            &buckets,
        );

        let t = &report.event_type_breakdown;
        Self::metric(
            &mut output,
            "tcp_latency_events_by_type",
            "counter",
            "Events broken down by hook",
            &[
                ("tcp_sendmsg", t.tcp_sendmsg),
                ("tcp_recvmsg", t.tcp_recvmsg),
                ("tcp_cleanup_rbuf", t.tcp_cleanup_rbuf),
            ]
            .map(|(hook, v)| (format!("{{type=\"{}\"}}", hook), v.to_string())),
        );

        let conn_samples: Vec<(String, String)> = report
            .connections
            .values()
            .map(|c| {
                (
                    format!("{{source=\"{}\",destination=\"{}\"}}", c.source, c.destination),
                    c.avg_latency_us.to_string(),
                )
            })
            .collect();
        Self::metric(
            &mut output,
            "tcp_latency_connection_avg_microseconds",
            "gauge",
            "Mean round-trip latency per connection",
            &conn_samples,
        );

        let k = &report.kernel_counters;
        Self::metric(
            &mut output,
            "tcp_latency_dropped_total",
            "counter",
            "Measurements dropped, by reason",
            &[
                ("unmatched", k.unmatched_receives),
                ("stale", k.stale_discards + k.userspace_stale_discards),
                ("map_full", k.map_update_failures),
                ("lost", k.lost_events),
                ("malformed", k.malformed_events),
            ]
            .map(|(reason, v)| (format!("{{reason=\"{}\"}}", reason), v.to_string())),
        );

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn render(&self, report: &LatencyReport) -> Result<String> {
        Ok(Self::to_prometheus_format(report))
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }
}

/// InfluxDB line protocol exporter
pub struct InfluxExporter {
    output_path: PathBuf,
    measurement: String,
}

impl InfluxExporter {
    pub fn new(output_path: PathBuf, measurement: String) -> Self {
        Self {
            output_path,
            measurement,
        }
    }

    /// Convert the report to InfluxDB line protocol
    fn to_influx_format(report: &LatencyReport, measurement: &str) -> String {
        let mut output = String::new();
        let timestamp = chrono::DateTime::parse_from_rfc3339(&report.timestamp)
            .ok()
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or(0);

        output.push_str(&format!(
            "{},type=summary total_events={}i,duration_seconds={}i,connections={}i {}\n",
            measurement,
            report.total_events,
            report.duration_seconds,
            report.connections.len(),
            timestamp
        ));

        let p = &report.percentiles;
        output.push_str(&format!(
            "{},type=percentiles p50={},p75={},p90={},p95={},p99={},p999={} {}\n",
            measurement, p.p50, p.p75, p.p90, p.p95, p.p99, p.p999, timestamp
        ));

        let h = &report.histogram;
        output.push_str(&format!(
            "{},type=histogram bucket_0_1ms={}i,bucket_1_5ms={}i,bucket_5_10ms={}i,bucket_10_50ms={}i,bucket_50_100ms={}i,bucket_100ms_plus={}i {}\n",
            measurement,
            h.bucket_0_1ms,
            h.bucket_1_5ms,
            h.bucket_5_10ms,
            h.bucket_10_50ms,
            h.bucket_50_100ms,
            h.bucket_100ms_plus,
            timestamp
        ));

        let t = &report.event_type_breakdown;
        output.push_str(&format!(
            "{},type=events tcp_sendmsg={}i,tcp_recvmsg={}i,tcp_cleanup_rbuf={}i {}\n",
            measurement, t.tcp_sendmsg, t.tcp_recvmsg, t.tcp_cleanup_rbuf, timestamp
        ));

        for conn in report.connections.values() {
            output.push_str(&format!(
                "{},type=connection,source={},destination={} events={}i,min_us={},max_us={},avg_us={},std_dev_us={} {}\n",
                measurement,
                conn.source,
                conn.destination,
                conn.events,
                conn.min_latency_us,
                conn.max_latency_us,
                conn.avg_latency_us,
                conn.std_dev_us,
                timestamp
            ));
        }

        output
    }
}

impl MetricsExporter for InfluxExporter {
    fn render(&self, report: &LatencyReport) -> Result<String> {
        Ok(Self::to_influx_format(report, &self.measurement))
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }
}

/// Export, retrying up to `retries` more times on failure
pub async fn export_with_retries(
    exporter: &dyn MetricsExporter,
    report: &LatencyReport,
    retries: u32,
) -> Result<(), ExportError> {
    let path = exporter.output_path().to_path_buf();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match exporter.export(report) {
            Ok(()) => {
                info!("✅ Metrics exported to {:?}", path);
                return Ok(());
            }
            Err(e) if attempts <= retries => {
                warn!("Export attempt {} to {:?} failed: {:#}", attempts, path, e);
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => {
                return Err(ExportError {
                    path,
                    attempts,
                    reason: format!("{:#}", e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{stats::Percentiles, types::*};
    use std::collections::BTreeMap;

    fn create_test_report() -> LatencyReport {
        let mut connections = BTreeMap::new();
        connections.insert(
            "10.0.0.1:40000 -> 10.0.0.2:80".to_string(),
            ConnectionMetrics {
                source: "10.0.0.1:40000".to_string(),
                destination: "10.0.0.2:80".to_string(),
                events: 3,
                min_latency_us: 90.0,
                max_latency_us: 300.0,
                avg_latency_us: 150.0,
                std_dev_us: 10.0,
            },
        );

        LatencyReport {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            duration_seconds: 60,
            total_events: 1000,
            connections,
            histogram: LatencyHistogram {
                bucket_0_1ms: 3,
                bucket_1_5ms: 2,
                ..Default::default()
            },
            percentiles: Percentiles {
                p50: 100.0,
                p75: 200.0,
                p90: 300.0,
                p95: 400.0,
                p99: 500.0,
                p999: 600.0,
            },
            event_type_breakdown: EventTypeBreakdown::default(),
            events_consumed: EventTypeBreakdown::default(),
            delivery: PhaseMetrics::default(),
            kernel_counters: KernelCounters::default(),
            config: ReportConfig::default(),
        }
    }

    #[test]
    fn test_format_aliases() {
        assert_eq!("json".parse::<ExporterType>(), Ok(ExporterType::Json));
        assert_eq!("prom".parse::<ExporterType>(), Ok(ExporterType::Prometheus));
        assert_eq!("InfluxDB".parse::<ExporterType>(), Ok(ExporterType::Influx));
        assert!("csv".parse::<ExporterType>().is_err());
    }

    #[test]
    fn test_json_field_names() {
        let report = create_test_report();
        let json = JsonExporter::new(PathBuf::new(), false).render(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["histogram"]["0-1ms"], 3);
        assert_eq!(value["histogram"]["100ms+"], 0);
        assert_eq!(value["percentiles"]["p999"], 600.0);
        assert_eq!(
            value["connections"]["10.0.0.1:40000 -> 10.0.0.2:80"]["std_dev_us"],
            10.0
        );
        assert!(value["kernel_counters"]["lost_events"].is_u64());
    }

    #[test]
    fn test_prometheus_format() {
        let report = create_test_report();
        let prometheus = PrometheusExporter::to_prometheus_format(&report);

        assert!(prometheus.contains("tcp_latency_events_total 1000"));
        assert!(prometheus.contains("tcp_latency_duration_seconds 60"));
        assert!(prometheus.contains("quantile=\"0.5\"} 100"));
        assert!(prometheus.contains("tcp_latency_round_trip_bucket{le=\"5000\"} 5"));
        assert!(prometheus.contains("tcp_latency_round_trip_bucket{le=\"+Inf\"} 5"));
        assert!(prometheus.contains("source=\"10.0.0.1:40000\""));
    }

    #[test]
    fn test_influx_format() {
        let report = create_test_report();
        let influx = InfluxExporter::to_influx_format(&report, "latency");

        assert!(influx.contains("latency,type=summary"));
        assert!(influx.contains("total_events=1000i"));
        assert!(influx.contains("p50=100"));
        assert!(influx.contains("type=connection,source=10.0.0.1:40000"));
        assert!(influx.lines().all(|line| line.ends_with(" 1735689600000000000")));
    }

    #[test]
    fn test_export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency-metrics.json");

        ExporterType::Json
            .build(path.clone())
            .export(&create_test_report())
            .unwrap();

        let written: LatencyReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, create_test_report());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_export_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.json");
        let exporter = JsonExporter::new(path.clone(), true);

        let err = export_with_retries(&exporter, &create_test_report(), 1)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
