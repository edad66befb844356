use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{PipelineError, Result, StageStatus};
use crate::source::TimestampQuality;
use crate::video::{Rational, rescale};

use super::{Backend, OutputQueue, PipelineFrame, PipelineItem, PipelineStage, StageKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AvSyncMode {
    /// Timestamps regenerated from the frame count.
    #[default]
    Cfr,
    /// Source timestamps kept; durations follow the real gaps.
    Vfr,
    /// Source timestamps snapped to a constant grid by dropping and repeating frames.
    #[value(name = "forcecfr")]
    #[serde(rename = "forcecfr")]
    ForceCfr,
}

/// Rewrites frame timing into the output timebase.
pub struct TimestampStage {
    mode: AvSyncMode,
    source_tb: Rational,
    output_tb: Rational,
    frame_duration: i64,
    queue: OutputQueue,
    next_index: i64,
    first_timestamp: Option<i64>,
    last_timestamp: Option<i64>,
    held: Option<PipelineFrame>,
    dropped: u64,
    duplicated: u64,
}

impl TimestampStage {
    pub fn new(
        mode: AvSyncMode,
        fps: Rational,
        source_tb: Rational,
        output_tb: Rational,
        quality: TimestampQuality,
    ) -> Result<Self> {
        if mode != AvSyncMode::Cfr && quality == TimestampQuality::None {
            return Err(PipelineError::InvalidVideoParam(format!(
                "sync mode {mode:?} needs source timestamps, but the input has none"
            )));
        }
        if !fps.is_valid() || !source_tb.is_valid() || !output_tb.is_valid() {
            return Err(PipelineError::InvalidVideoParam(format!(
                "frame rate {fps}, source timebase {source_tb} and output timebase {output_tb} must be positive"
            )));
        }
        let frame_duration = rescale(1, fps.inv(), output_tb).max(1);
        debug!(?mode, %source_tb, %output_tb, frame_duration, "Timestamp correction configured");
        Ok(Self {
            mode,
            source_tb,
            output_tb,
            frame_duration,
            queue: OutputQueue::default(),
            next_index: 0,
            first_timestamp: None,
            last_timestamp: None,
            held: None,
            dropped: 0,
            duplicated: 0,
        })
    }

    pub fn frame_duration(&self) -> i64 {
        self.frame_duration
    }

    /// Source timestamp in output ticks, relative to the first frame.
    fn output_time(&mut self, timestamp: i64) -> i64 {
        let ts = rescale(timestamp, self.source_tb, self.output_tb);
        let first = *self.first_timestamp.get_or_insert(ts);
        ts - first
    }

    fn push_cfr(&mut self, mut frame: PipelineFrame) {
        frame.meta.timestamp = self.next_index * self.frame_duration;
        frame.meta.duration = self.frame_duration;
        self.next_index += 1;
        self.queue.push(PipelineItem::Frame(frame));
    }

    fn push_vfr(&mut self, mut frame: PipelineFrame) {
        let mut ts = self.output_time(frame.meta.timestamp);
        if let Some(last) = self.last_timestamp
            && ts <= last
        {
            trace!(ts, last, "Non-increasing timestamp repaired");
            ts = last + 1;
        }
        self.last_timestamp = Some(ts);
        frame.meta.timestamp = ts;
        if let Some(mut previous) = self.held.take() {
            previous.meta.duration = ts - previous.meta.timestamp;
            self.queue.push(PipelineItem::Frame(previous));
        }
        self.held = Some(frame);
    }

    fn push_force_cfr(&mut self, mut frame: PipelineFrame) {
        let ts = self.output_time(frame.meta.timestamp);
        let dur = self.frame_duration;
        let slot = (ts + dur / 2).div_euclid(dur);
        if slot < self.next_index {
            trace!(ts, slot, expected = self.next_index, "Early frame dropped");
            self.dropped += 1;
            return;
        }
        while self.next_index < slot {
            let mut copy = frame.share();
            copy.meta.timestamp = self.next_index * dur;
            copy.meta.duration = dur;
            self.queue.push(PipelineItem::Frame(copy));
            self.next_index += 1;
            self.duplicated += 1;
        }
        frame.meta.timestamp = slot * dur;
        frame.meta.duration = dur;
        self.next_index = slot + 1;
        self.queue.push(PipelineItem::Frame(frame));
    }

    fn status(&self) -> StageStatus {
        if self.queue.is_empty() {
            StageStatus::NeedMoreInput
        } else {
            StageStatus::Ok
        }
    }
}

impl PipelineStage for TimestampStage {
    fn name(&self) -> &str {
        "timestamp"
    }

    fn kind(&self) -> StageKind {
        StageKind::Timestamp
    }

    fn backend(&self) -> Backend {
        Backend::Host
    }

    fn is_pass_through(&self) -> bool {
        true
    }

    fn send(&mut self, input: Option<PipelineItem>) -> Result<StageStatus> {
        let Some(item) = input else {
            if let Some(mut last) = self.held.take() {
                last.meta.duration = self.frame_duration;
                self.queue.push(PipelineItem::Frame(last));
            }
            return Ok(if self.queue.is_empty() {
                StageStatus::EndOfStream
            } else {
                StageStatus::Ok
            });
        };
        let frame = item.into_frame(self.name())?;
        match self.mode {
            AvSyncMode::Cfr => self.push_cfr(frame),
            AvSyncMode::Vfr => self.push_vfr(frame),
            AvSyncMode::ForceCfr => self.push_force_cfr(frame),
        }
        Ok(self.status())
    }

    fn drain(&mut self, _sync: bool) -> Result<Vec<PipelineItem>> {
        Ok(self.queue.drain(true))
    }

    fn output_count(&self) -> u64 {
        self.queue.emitted()
    }

    fn frames_dropped(&self) -> u64 {
        self.dropped
    }

    fn frames_duplicated(&self) -> u64 {
        self.duplicated
    }
}
