use tracing::trace;

use crate::error::{Result, StageStatus};
use crate::video::TrimParam;

use super::{Backend, OutputQueue, PipelineItem, PipelineStage, StageKind};

/// Drops frames outside the trim ranges and renumbers the rest from zero.
///
/// Kept frames are shifted back by the duration of everything dropped before them,
/// so the output timeline has no holes.
pub struct TrimStage {
    trim: TrimParam,
    queue: OutputQueue,
    kept: u64,
    dropped: u64,
    dropped_duration: i64,
}

impl TrimStage {
    pub fn new(trim: TrimParam) -> Self {
        Self {
            trim,
            queue: OutputQueue::default(),
            kept: 0,
            dropped: 0,
            dropped_duration: 0,
        }
    }
}

impl PipelineStage for TrimStage {
    fn name(&self) -> &str {
        "trim"
    }

    fn kind(&self) -> StageKind {
        StageKind::Trim
    }

    fn backend(&self) -> Backend {
        Backend::Host
    }

    fn is_pass_through(&self) -> bool {
        true
    }

    fn send(&mut self, input: Option<PipelineItem>) -> Result<StageStatus> {
        let Some(item) = input else {
            return Ok(if self.queue.is_empty() {
                StageStatus::EndOfStream
            } else {
                StageStatus::Ok
            });
        };
        let mut frame = item.into_frame(self.name())?;
        let index = frame.meta.input_frame_id;
        if !self.trim.keeps(index) {
            trace!(index, "Frame outside trim ranges dropped");
            self.dropped += 1;
            self.dropped_duration += frame.meta.duration;
            return Ok(StageStatus::NeedMoreInput);
        }
        frame.meta.input_frame_id = self.kept;
        frame.meta.timestamp -= self.dropped_duration;
        self.kept += 1;
        self.queue.push(PipelineItem::Frame(frame));
        Ok(StageStatus::Ok)
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
}
