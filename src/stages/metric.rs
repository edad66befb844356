use crate::error::{Result, StageStatus};
use crate::quality::SharedMetric;

use super::{Backend, OutputQueue, PipelineItem, PipelineStage, StageKind};

/// Records every passing frame as a quality reference.
pub struct MetricStage {
    metric: SharedMetric,
    queue: OutputQueue,
}

impl MetricStage {
    pub fn new(metric: SharedMetric) -> Self {
        Self {
            metric,
            queue: OutputQueue::default(),
        }
    }
}

impl PipelineStage for MetricStage {
    fn name(&self) -> &str {
        "quality-metric"
    }

    fn kind(&self) -> StageKind {
        StageKind::QualityMetric
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
        let frame = item.into_frame(self.name())?;
        self.metric.lock().add_reference(&frame)?;
        self.queue.push(PipelineItem::Frame(frame));
        Ok(StageStatus::Ok)
    }

    fn drain(&mut self, _sync: bool) -> Result<Vec<PipelineItem>> {
        Ok(self.queue.drain(true))
    }

    fn output_count(&self) -> u64 {
        self.queue.emitted()
    }

    fn has_metric(&self) -> bool {
        true
    }
}
