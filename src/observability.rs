use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub frames_read: u64,
    pub frames_dropped: u64,
    pub frames_duplicated: u64,
    pub frames_written: u64,
    pub units_written: u64,
    pub bytes_written: u64,
    pub quality_passes: u64,
    pub quality_failures: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Totals of one pipeline run, added to the collector in one step.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct RunCounters {
    pub frames_read: u64,
    pub frames_dropped: u64,
    pub frames_duplicated: u64,
    pub frames_written: u64,
    pub units_written: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
        &INSTANCE
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms += duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_run(&self, counters: &RunCounters) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.frames_read += counters.frames_read;
            guard.frames_dropped += counters.frames_dropped;
            guard.frames_duplicated += counters.frames_duplicated;
            guard.frames_written += counters.frames_written;
            guard.units_written += counters.units_written;
            guard.bytes_written += counters.bytes_written;
        }
    }

    pub fn record_job(&self, success: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            if success {
                guard.jobs_completed += 1;
            } else {
                guard.jobs_failed += 1;
            }
        }
    }

    pub fn record_quality_pass(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.quality_passes += 1;
        }
    }

    pub fn record_quality_failure(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.quality_failures += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Adds its lifetime to the stage's call statistics when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        jobs_completed = snapshot.jobs_completed,
        jobs_failed = snapshot.jobs_failed,
        frames_read = snapshot.frames_read,
        frames_written = snapshot.frames_written,
        units_written = snapshot.units_written,
        bytes_written = snapshot.bytes_written,
        quality_passes = snapshot.quality_passes,
        quality_failures = snapshot.quality_failures,
        "Transcode metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        debug!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP hwtc_{name} {help}");
    let _ = writeln!(output, "# TYPE hwtc_{name} counter");
    let _ = writeln!(output, "hwtc_{name} {value}");
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        counter(&mut output, "jobs_completed_total", "Inputs transcoded successfully", self.jobs_completed);
        counter(&mut output, "jobs_failed_total", "Inputs that failed to transcode", self.jobs_failed);
        counter(&mut output, "frames_read_total", "Frames delivered by the input stage", self.frames_read);
        counter(&mut output, "frames_dropped_total", "Frames dropped by trim or sync correction", self.frames_dropped);
        counter(&mut output, "frames_duplicated_total", "Frames repeated by sync correction", self.frames_duplicated);
        counter(&mut output, "frames_written_total", "Raw frames written to the sink", self.frames_written);
        counter(&mut output, "units_written_total", "Encoded units written to the sink", self.units_written);
        counter(&mut output, "bytes_written_total", "Encoded bytes written to the sink", self.bytes_written);
        counter(&mut output, "quality_passes_total", "Total number of quality gate passes", self.quality_passes);
        counter(&mut output, "quality_failures_total", "Total number of quality gate failures", self.quality_failures);

        output.push_str("# HELP hwtc_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE hwtc_stage_calls_total counter\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(output, "hwtc_stage_calls_total{{stage=\"{stage}\"}} {}", metrics.calls);
        }
        output.push_str("# HELP hwtc_stage_duration_seconds_total Accumulated stage duration in seconds\n");
        output.push_str("# TYPE hwtc_stage_duration_seconds_total counter\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(
                output,
                "hwtc_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP hwtc_stage_duration_seconds_max Maximum stage duration in seconds\n");
        output.push_str("# TYPE hwtc_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(
                output,
                "hwtc_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP hwtc_transcode_duration_seconds Total transcode duration\n");
        output.push_str("# TYPE hwtc_transcode_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "hwtc_transcode_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_timer_records_on_drop() {
        let metrics = MetricsCollector::new();
        {
            let _timer = metrics.start_stage("encode");
        }
        drop(metrics.start_stage("encode"));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages["encode"].calls, 2);
    }

    #[test]
    fn run_counters_accumulate_and_render() {
        let metrics = MetricsCollector::new();
        let run = RunCounters {
            frames_read: 30,
            frames_dropped: 2,
            units_written: 28,
            bytes_written: 4096,
            ..RunCounters::default()
        };
        metrics.record_run(&run);
        metrics.record_run(&run);
        metrics.record_job(true);
        let snapshot = metrics.snapshot();
        assert_eq!((snapshot.frames_read, snapshot.units_written), (60, 56));
        let text = snapshot.to_prometheus();
        assert!(text.contains("hwtc_bytes_written_total 8192\n"));
        assert!(text.contains("hwtc_jobs_completed_total 1\n"));
        metrics.reset();
        assert_eq!(metrics.snapshot().frames_read, 0);
    }
}
