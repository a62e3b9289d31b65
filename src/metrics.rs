#![forbid(unsafe_code)]

// Performance metrics - latency samples, failure counts and their summary

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Which sample sequence a measurement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    ConnectionTime,
    MessageLatency,
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleKind::ConnectionTime => write!(f, "connection time"),
            SampleKind::MessageLatency => write!(f, "message latency"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    #[error("No {0} samples recorded")]
    EmptySamples(SampleKind),

    #[error("No operations recorded")]
    NoOperations,
}

/// Per-scenario accumulator. Append/increment only; shared by every task of
/// a scenario through an `Arc`.
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    connection_times: Mutex<Vec<f64>>,
    message_latencies: Mutex<Vec<f64>>,
    failed_operations: AtomicU64,
    total_operations: AtomicU64,
}

/// Point-in-time copy of the raw counters and samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub connection_times: Vec<f64>,
    pub message_latencies: Vec<f64>,
    pub failed_operations: u64,
    pub total_operations: u64,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample, in seconds.
    pub fn record(&self, kind: SampleKind, elapsed: Duration) {
        self.samples(kind)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self) {
        self.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count attempted operations. Called by the orchestrator once the
    /// attempt counts of a scenario are known.
    pub fn add_operations(&self, n: u64) {
        self.total_operations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn failed_operations(&self) -> u64 {
        self.failed_operations.load(Ordering::Relaxed)
    }

    pub fn total_operations(&self) -> u64 {
        self.total_operations.load(Ordering::Relaxed)
    }

    pub fn sample_count(&self, kind: SampleKind) -> usize {
        self.samples(kind).lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_times: self.connection_times.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            message_latencies: self.message_latencies.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            failed_operations: self.failed_operations(),
            total_operations: self.total_operations(),
        }
    }

    /// Mean, p95 and success rate over what has been recorded.
    ///
    /// An empty sample sequence is reported as `None` for that sequence; only
    /// a scenario with no operations at all fails.
    pub fn summary(&self) -> Result<MetricsSummary, MetricsError> {
        MetricsSummary::from_snapshot(&self.snapshot())
    }

    /// Mean and p95 of one sequence, in seconds.
    pub fn stats(&self, kind: SampleKind) -> Result<(f64, f64), MetricsError> {
        let samples = self.samples(kind).lock().unwrap_or_else(|e| e.into_inner());
        match (mean(&samples), percentile(&samples, 95.0)) {
            (Some(avg), Some(p95)) => Ok((avg, p95)),
            _ => Err(MetricsError::EmptySamples(kind)),
        }
    }

    fn samples(&self, kind: SampleKind) -> &Mutex<Vec<f64>> {
        match kind {
            SampleKind::ConnectionTime => &self.connection_times,
            SampleKind::MessageLatency => &self.message_latencies,
        }
    }
}

/// Scenario summary. Latencies in seconds rounded to 3 decimals, success rate
/// as a percentage rounded to 2.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub connection_time_avg: Option<f64>,
    pub connection_time_p95: Option<f64>,
    pub message_latency_avg: Option<f64>,
    pub message_latency_p95: Option<f64>,
    pub success_rate: f64,
    pub failed_operations: u64,
    pub total_operations: u64,
}

impl MetricsSummary {
    pub fn from_snapshot(snapshot: &MetricsSnapshot) -> Result<Self, MetricsError> {
        let rate = success_rate(snapshot.total_operations, snapshot.failed_operations)
            .ok_or(MetricsError::NoOperations)?;

        let conn_avg = mean(&snapshot.connection_times).map(round3);
        let conn_p95 = percentile(&snapshot.connection_times, 95.0).map(round3);
        let msg_avg = mean(&snapshot.message_latencies).map(round3);
        let msg_p95 = percentile(&snapshot.message_latencies, 95.0).map(round3);

        Ok(Self {
            connection_time_avg: conn_avg,
            connection_time_p95: conn_p95,
            message_latency_avg: msg_avg,
            message_latency_p95: msg_p95,
            success_rate: (rate * 100.0 * 100.0).round() / 100.0,
            failed_operations: snapshot.failed_operations,
            total_operations: snapshot.total_operations,
        })
    }

    pub fn print_summary(&self) {
        println!("  Connection Time:");
        println!("    Average: {}", fmt_secs(self.connection_time_avg));
        println!("    P95: {}", fmt_secs(self.connection_time_p95));
        println!("  Message Latency:");
        println!("    Average: {}", fmt_secs(self.message_latency_avg));
        println!("    P95: {}", fmt_secs(self.message_latency_p95));
        println!("  Success Rate: {:.2}%", self.success_rate);
        println!("  Failed Operations: {} / {}", self.failed_operations, self.total_operations);
    }
}

fn fmt_secs(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.3} s", v),
        None => "n/a".to_string(),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Arithmetic mean; `None` for an empty sequence. The input need not be sorted.
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// `p`-th percentile (0..=100) with linear interpolation between closest
/// ranks: rank = p/100 * (n - 1). `None` for an empty sequence.
pub fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// `(total - failed) / total`, undefined when nothing was attempted.
pub fn success_rate(total: u64, failed: u64) -> Option<f64> {
    debug_assert!(failed <= total, "failed operations ({failed}) exceed total ({total})");
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(failed) as f64 / total as f64)
}
