//! Service metrics for Prometheus
//!
//! Tracks admissions, upload outcomes, replication progress and read
//! sources. Counters are plain atomics; gauges are computed from the live
//! components when exporting.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Why an admission was refused, as counted by metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
    GlobalCapacity,
    OwnerCapacity,
    MemoryBudget,
    ShuttingDown,
}

impl DenialKind {
    pub const ALL: [Self; 4] = [
        Self::GlobalCapacity,
        Self::OwnerCapacity,
        Self::MemoryBudget,
        Self::ShuttingDown,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GlobalCapacity => "global_capacity",
            Self::OwnerCapacity => "owner_capacity",
            Self::MemoryBudget => "memory_budget",
            Self::ShuttingDown => "shutting_down",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::GlobalCapacity => 0,
            Self::OwnerCapacity => 1,
            Self::MemoryBudget => 2,
            Self::ShuttingDown => 3,
        }
    }
}

/// How an upload session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Counters shared by all service components
#[derive(Debug)]
pub struct ServiceMetrics {
    admissions_granted: AtomicU64,
    admissions_denied: [AtomicU64; 4],
    internal_faults: AtomicU64,
    pool_exhausted: AtomicU64,
    uploads_completed: AtomicU64,
    uploads_failed: AtomicU64,
    uploads_cancelled: AtomicU64,
    bytes_uploaded: AtomicU64,
    replication_completed: AtomicU64,
    replication_retried: AtomicU64,
    replication_failed: AtomicU64,
    reads_primary: AtomicU64,
    reads_fallback: AtomicU64,
    reads_failed: AtomicU64,
    start_time: Instant,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            admissions_granted: AtomicU64::new(0),
            admissions_denied: Default::default(),
            internal_faults: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            uploads_completed: AtomicU64::new(0),
            uploads_failed: AtomicU64::new(0),
            uploads_cancelled: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            replication_completed: AtomicU64::new(0),
            replication_retried: AtomicU64::new(0),
            replication_failed: AtomicU64::new(0),
            reads_primary: AtomicU64::new(0),
            reads_fallback: AtomicU64::new(0),
            reads_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_admission_granted(&self) {
        self.admissions_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_denied(&self, kind: DenialKind) {
        self.admissions_denied[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_internal_fault(&self) {
        self.internal_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, outcome: UploadOutcome, bytes: u64) {
        let counter = match outcome {
            UploadOutcome::Completed => &self.uploads_completed,
            UploadOutcome::Failed => &self.uploads_failed,
            UploadOutcome::Cancelled => &self.uploads_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if outcome == UploadOutcome::Completed {
            self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_replication_completed(&self) {
        self.replication_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_retry(&self) {
        self.replication_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_failed(&self) {
        self.replication_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_primary(&self) {
        self.reads_primary.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_fallback(&self) {
        self.reads_fallback.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_failed(&self) {
        self.reads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admissions_denied(&self, kind: DenialKind) -> u64 {
        self.admissions_denied[kind.index()].load(Ordering::Relaxed)
    }

    pub fn internal_faults(&self) -> u64 {
        self.internal_faults.load(Ordering::Relaxed)
    }

    pub fn uploads(&self, outcome: UploadOutcome) -> u64 {
        match outcome {
            UploadOutcome::Completed => self.uploads_completed.load(Ordering::Relaxed),
            UploadOutcome::Failed => self.uploads_failed.load(Ordering::Relaxed),
            UploadOutcome::Cancelled => self.uploads_cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn replication_retries(&self) -> u64 {
        self.replication_retried.load(Ordering::Relaxed)
    }

    pub fn reads_fallback(&self) -> u64 {
        self.reads_fallback.load(Ordering::Relaxed)
    }

    /// Export counters in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(4 * 1024);

        write_metric(
            &mut output,
            "mirrorpool_uptime_seconds",
            "Service uptime in seconds",
            "counter",
            self.start_time.elapsed().as_secs(),
        );
        write_metric(
            &mut output,
            "mirrorpool_admissions_granted_total",
            "Upload admissions granted",
            "counter",
            self.admissions_granted.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            output,
            "# HELP mirrorpool_admissions_denied_total Upload admissions denied by reason"
        );
        let _ = writeln!(output, "# TYPE mirrorpool_admissions_denied_total counter");
        for kind in DenialKind::ALL {
            let _ = writeln!(
                output,
                "mirrorpool_admissions_denied_total{{reason=\"{}\"}} {}",
                kind.as_str(),
                self.admissions_denied(kind)
            );
        }

        write_metric(
            &mut output,
            "mirrorpool_internal_faults_total",
            "Internal faults surfaced to callers",
            "counter",
            self.internal_faults(),
        );
        write_metric(
            &mut output,
            "mirrorpool_pool_exhausted_total",
            "Account selections that found no eligible account",
            "counter",
            self.pool_exhausted.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            output,
            "# HELP mirrorpool_uploads_total Upload sessions by outcome"
        );
        let _ = writeln!(output, "# TYPE mirrorpool_uploads_total counter");
        for (label, outcome) in [
            ("completed", UploadOutcome::Completed),
            ("failed", UploadOutcome::Failed),
            ("cancelled", UploadOutcome::Cancelled),
        ] {
            let _ = writeln!(
                output,
                "mirrorpool_uploads_total{{outcome=\"{label}\"}} {}",
                self.uploads(outcome)
            );
        }

        write_metric(
            &mut output,
            "mirrorpool_uploaded_bytes_total",
            "Bytes stored by completed uploads",
            "counter",
            self.bytes_uploaded.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "mirrorpool_replication_completed_total",
            "Objects copied to the secondary backend",
            "counter",
            self.replication_completed.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "mirrorpool_replication_retries_total",
            "Replication attempts re-enqueued after a transient failure",
            "counter",
            self.replication_retries(),
        );
        write_metric(
            &mut output,
            "mirrorpool_replication_failed_total",
            "Objects whose replication was abandoned",
            "counter",
            self.replication_failed.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            output,
            "# HELP mirrorpool_reads_total Object reads by serving source"
        );
        let _ = writeln!(output, "# TYPE mirrorpool_reads_total counter");
        let _ = writeln!(
            output,
            "mirrorpool_reads_total{{source=\"primary\"}} {}",
            self.reads_primary.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            output,
            "mirrorpool_reads_total{{source=\"secondary\"}} {}",
            self.reads_fallback()
        );
        let _ = writeln!(
            output,
            "mirrorpool_reads_total{{source=\"none\"}} {}",
            self.reads_failed.load(Ordering::Relaxed)
        );

        output
    }
}

/// Append one unlabeled metric with its HELP and TYPE lines
pub fn write_metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_counters() {
        let metrics = ServiceMetrics::new();
        metrics.record_admission_granted();
        metrics.record_admission_denied(DenialKind::MemoryBudget);
        metrics.record_upload(UploadOutcome::Completed, 128);
        metrics.record_read_fallback();

        let text = metrics.export_prometheus();
        assert!(text.contains("mirrorpool_admissions_granted_total 1"));
        assert!(text.contains("mirrorpool_admissions_denied_total{reason=\"memory_budget\"} 1"));
        assert!(text.contains("mirrorpool_uploads_total{outcome=\"completed\"} 1"));
        assert!(text.contains("mirrorpool_uploaded_bytes_total 128"));
        assert!(text.contains("mirrorpool_reads_total{source=\"secondary\"} 1"));
    }
}
