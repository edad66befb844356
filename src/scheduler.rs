use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result, StageStatus};
use crate::observability::{MetricsCollector, RunCounters};
use crate::sink::OutputSink;
use crate::stages::{PipelineItem, PipelineStage};

/// Rounds without progress before a blocked pipeline is reported as starved of buffers.
const MAX_STALLS: u32 = 10_000;

/// Whether compute filters may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ComputePolicy {
    /// Use compute when the device offers it.
    #[default]
    Auto,
    Disabled,
    /// Fail when the device has no compute backend.
    Required,
}

impl ComputePolicy {
    pub fn resolve(self, device_has_compute: bool) -> Result<bool> {
        let available = device_has_compute && !compute_disabled_by_env();
        match self {
            ComputePolicy::Disabled => Ok(false),
            ComputePolicy::Auto => Ok(available),
            ComputePolicy::Required if available => Ok(true),
            ComputePolicy::Required => Err(PipelineError::UnsupportedOperation(
                "compute backend required but not available".into(),
            )),
        }
    }
}

fn compute_disabled_by_env() -> bool {
    std::env::var("HWTC_DISABLE_COMPUTE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Cooperative abort flag, polled once per scheduler iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Paces input pulls to at most `max_fps` per second.
#[derive(Debug, Clone)]
pub struct SpeedLimiter {
    interval: Duration,
    next: Option<Instant>,
}

impl SpeedLimiter {
    pub fn new(max_fps: f64) -> Option<Self> {
        if !(max_fps.is_finite() && max_fps > 0.0) {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs_f64(1.0 / max_fps),
            next: None,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn pace(&mut self) {
        let now = Instant::now();
        let slot = self.next.unwrap_or(now);
        if slot > now {
            std::thread::sleep(slot - now);
        }
        self.next = Some(slot.max(now) + self.interval);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Flushing,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub name: String,
    pub outputs: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub counters: RunCounters,
    pub elapsed_ms: f64,
    pub stages: Vec<StageRun>,
}

/// Whether stage `index` has to finish outstanding work before handing output on.
///
/// Always true at the tail. Otherwise the nearest active stage at or before `index`
/// decides against the next active stage's backend; pass-through stages never split a
/// same-backend run.
pub fn require_sync(stages: &[Box<dyn PipelineStage>], index: usize) -> bool {
    if index + 1 >= stages.len() {
        return true;
    }
    let source = (0..=index)
        .rev()
        .find(|&i| !stages[i].is_pass_through())
        .unwrap_or(index);
    match stages[index + 1..].iter().find(|stage| !stage.is_pass_through()) {
        Some(next) => stages[source].requires_sync_with(next.backend()),
        None => true,
    }
}

/// Drives a built stage list from the first input to the last flushed output.
pub struct Scheduler {
    cancel: CancelToken,
    limiter: Option<SpeedLimiter>,
    metrics: MetricsCollector,
    state: RunState,
}

impl Scheduler {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            limiter: None,
            metrics: MetricsCollector::global().clone(),
            state: RunState::Idle,
        }
    }

    pub fn with_speed_limit(mut self, max_fps: Option<f64>) -> Self {
        self.limiter = max_fps.and_then(SpeedLimiter::new);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run(
        &mut self,
        stages: &mut [Box<dyn PipelineStage>],
        sink: &mut dyn OutputSink,
    ) -> Result<RunSummary> {
        if stages.is_empty() {
            return Err(PipelineError::InvalidOperation(
                "pipeline has no stages".into(),
            ));
        }
        let started = Instant::now();
        let mut run = Run {
            stages,
            sink,
            queue: VecDeque::new(),
            counters: RunCounters::default(),
            metrics: self.metrics.clone(),
            blocked: false,
        };

        self.state = RunState::Running;
        debug!(stages = run.stages.len(), sink = %run.sink.message(), "Pipeline running");
        let result = self
            .drive(&mut run)
            .and_then(|()| {
                self.state = RunState::Flushing;
                debug!("Input exhausted, flushing stages");
                self.flush(&mut run)
            })
            .and_then(|()| run.sink.wait_for_completion());

        let counters = run.totals();
        let elapsed = started.elapsed();
        self.metrics.record_run(&counters);
        self.metrics.record_total_duration(elapsed);

        match result {
            Ok(()) => {
                self.state = RunState::Done;
                let summary = RunSummary {
                    state: self.state,
                    counters,
                    elapsed_ms: elapsed.as_secs_f64() * 1_000.0,
                    stages: run.stage_runs(),
                };
                info!(
                    frames_read = counters.frames_read,
                    units_written = counters.units_written,
                    frames_written = counters.frames_written,
                    bytes_written = counters.bytes_written,
                    elapsed_ms = summary.elapsed_ms,
                    "Pipeline finished"
                );
                Ok(summary)
            }
            Err(PipelineError::Aborted) => {
                self.state = RunState::Aborted;
                if let Err(err) = run.sink.wait_for_completion() {
                    warn!(error = %err, "Sink did not complete after abort");
                }
                warn!(frames_read = counters.frames_read, "Pipeline aborted");
                Err(PipelineError::Aborted)
            }
            Err(err) => {
                self.state = RunState::Done;
                Err(err)
            }
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Aborted)
        } else {
            Ok(())
        }
    }

    fn drive(&mut self, run: &mut Run<'_>) -> Result<()> {
        let mut stalls = 0u32;
        let mut pull_status = StageStatus::Ok;
        loop {
            self.check_cancel()?;
            let Some((index, item)) = run.queue.pop_front() else {
                let blocked = std::mem::take(&mut run.blocked);
                if run.probe(blocked)? {
                    continue;
                }
                if blocked {
                    stalls += 1;
                    if stalls > MAX_STALLS {
                        return Err(PipelineError::Allocation(
                            "pipeline stalled: no stage can release a buffer".into(),
                        ));
                    }
                }
                if pull_status == StageStatus::Ok
                    && let Some(limiter) = self.limiter.as_mut()
                {
                    limiter.pace();
                }
                run.queue.push_back((0, None));
                continue;
            };
            let status = run.step(index, item)?;
            if index == 0 {
                pull_status = status;
                if !status.keeps_running() {
                    return Ok(());
                }
                if status == StageStatus::Ok {
                    stalls = 0;
                }
            }
        }
    }

    fn flush(&mut self, run: &mut Run<'_>) -> Result<()> {
        for stage in run.stages.iter_mut() {
            stage.set_output_hold(0);
        }
        for index in 0..run.stages.len() {
            let mut idle = 0u32;
            loop {
                self.check_cancel()?;
                let (status, produced) = run.flush_step(index)?;
                let progressed =
                    produced || (status == StageStatus::NeedMoreSlots && run.probe(true)?);
                while let Some((next, item)) = run.queue.pop_front() {
                    self.check_cancel()?;
                    run.step(next, item)?;
                }
                if !status.keeps_flushing() && !produced {
                    break;
                }
                if progressed {
                    idle = 0;
                } else {
                    idle += 1;
                    if idle > MAX_STALLS {
                        return Err(PipelineError::Allocation(format!(
                            "stage '{}' cannot flush: no free output buffer",
                            run.stages[index].name()
                        )));
                    }
                }
            }
            debug!(stage = run.stages[index].name(), watermark = index + 1, "Stage flushed");
        }
        Ok(())
    }
}

/// Mutable state of one `Scheduler::run` call.
struct Run<'a> {
    stages: &'a mut [Box<dyn PipelineStage>],
    sink: &'a mut dyn OutputSink,
    queue: VecDeque<(usize, Option<PipelineItem>)>,
    counters: RunCounters,
    metrics: MetricsCollector,
    blocked: bool,
}

impl Run<'_> {
    fn step(&mut self, index: usize, item: Option<PipelineItem>) -> Result<StageStatus> {
        if index == self.stages.len() {
            if let Some(item) = item {
                self.deliver(item)?;
            }
            return Ok(StageStatus::Ok);
        }
        let sync = require_sync(self.stages, index);
        let stage = &mut self.stages[index];
        let _timer = self.metrics.start_stage(stage.name());
        let status = stage.send(item)?;
        if status == StageStatus::NeedMoreSlots {
            self.blocked = true;
        }
        if status.has_output() {
            let outputs = stage.drain(sync)?;
            self.push_front(index + 1, outputs);
        }
        Ok(status)
    }

    /// Terminal input to `index` followed by a synchronous drain.
    fn flush_step(&mut self, index: usize) -> Result<(StageStatus, bool)> {
        let stage = &mut self.stages[index];
        let _timer = self.metrics.start_stage(stage.name());
        let status = stage.send(None)?;
        let outputs = stage.drain(true)?;
        let produced = !outputs.is_empty();
        self.push_front(index + 1, outputs);
        Ok((status, produced))
    }

    /// Re-feeds the first stage with output ready, front to back.
    ///
    /// `force` also completes outstanding asynchronous work, which only a buffer
    /// shortage warrants.
    fn probe(&mut self, force: bool) -> Result<bool> {
        for index in 0..self.stages.len() {
            let sync = require_sync(self.stages, index);
            let stage = &mut self.stages[index];
            let mut outputs = stage.drain(sync)?;
            if outputs.is_empty() && force && !sync {
                outputs = stage.drain(true)?;
            }
            if !outputs.is_empty() {
                debug!(stage = stage.name(), items = outputs.len(), "Probe found ready output");
                self.push_front(index + 1, outputs);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn push_front(&mut self, index: usize, outputs: Vec<PipelineItem>) {
        for item in outputs.into_iter().rev() {
            self.queue.push_front((index, Some(item)));
        }
    }

    fn deliver(&mut self, item: PipelineItem) -> Result<()> {
        match item {
            PipelineItem::Bitstream(mut unit) => {
                let size = unit.size() as u64;
                self.sink.write_bitstream(&mut unit)?;
                self.counters.units_written += 1;
                self.counters.bytes_written += size;
            }
            PipelineItem::Frame(frame) => {
                let buffer = frame.handle.lock();
                self.sink.write_frame(&buffer, &frame.meta)?;
                self.counters.frames_written += 1;
            }
        }
        Ok(())
    }

    fn totals(&self) -> RunCounters {
        let mut counters = self.counters;
        counters.frames_read = self.stages.first().map_or(0, |stage| stage.output_count());
        counters.frames_dropped = self.stages.iter().map(|stage| stage.frames_dropped()).sum();
        counters.frames_duplicated = self.stages.iter().map(|stage| stage.frames_duplicated()).sum();
        counters
    }

    fn stage_runs(&self) -> Vec<StageRun> {
        self.stages
            .iter()
            .map(|stage| StageRun {
                name: stage.name().to_string(),
                outputs: stage.output_count(),
                dropped: stage.frames_dropped(),
                duplicated: stage.frames_duplicated(),
            })
            .collect()
    }
}
