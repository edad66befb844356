use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::error::{PipelineError, Result, StageStatus};
use crate::pool::FrameHandle;
use crate::video::{BitstreamUnit, FrameMeta, FrameShape, MemoryDomain};

pub mod audio;
pub mod encode;
pub mod filter_block;
pub mod input;
pub mod metric;
pub mod timestamp;
pub mod trim;

pub use audio::AudioStage;
pub use encode::EncodeStage;
pub use filter_block::FilterBlockStage;
pub use input::{DecodeStage, InputStage};
pub use metric::MetricStage;
pub use timestamp::{AvSyncMode, TimestampStage};
pub use trim::TrimStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Input,
    Decode,
    Audio,
    Trim,
    Timestamp,
    FilterBlock,
    QualityMetric,
    Encode,
}

/// Execution engine a stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Host,
    Codec,
    Compute,
    FixedFunction,
}

impl Backend {
    /// Dedicated video hardware (codec engine or fixed-function scaler).
    pub fn is_hardware(self) -> bool {
        matches!(self, Backend::Codec | Backend::FixedFunction)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Host => "host",
            Backend::Codec => "codec",
            Backend::Compute => "compute",
            Backend::FixedFunction => "fixed-function",
        };
        f.write_str(name)
    }
}

/// Buffer shape and minimum count a stage needs on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SurfaceRequest {
    pub shape: FrameShape,
    pub count: usize,
}

impl SurfaceRequest {
    pub fn new(shape: FrameShape, count: usize) -> Self {
        Self { shape, count }
    }
}

#[derive(Debug)]
pub struct PipelineFrame {
    pub handle: FrameHandle,
    pub meta: FrameMeta,
}

impl PipelineFrame {
    pub fn new(handle: FrameHandle, meta: FrameMeta) -> Self {
        Self { handle, meta }
    }

    /// A second reference to the same picture with its own metadata.
    pub fn share(&self) -> PipelineFrame {
        PipelineFrame {
            handle: self.handle.share(),
            meta: self.meta.clone(),
        }
    }
}

#[derive(Debug)]
pub enum PipelineItem {
    Frame(PipelineFrame),
    Bitstream(BitstreamUnit),
}

impl PipelineItem {
    pub fn into_frame(self, stage: &str) -> Result<PipelineFrame> {
        match self {
            PipelineItem::Frame(frame) => Ok(frame),
            PipelineItem::Bitstream(_) => Err(PipelineError::stage(
                stage,
                "received a bitstream unit where a frame was expected",
            )),
        }
    }
}

/// Ready outputs of a stage.
///
/// Without a sync request the newest `hold` items stay queued, standing in for work
/// still in flight on an asynchronous engine.
#[derive(Debug, Default)]
pub struct OutputQueue {
    items: VecDeque<PipelineItem>,
    hold: usize,
    emitted: u64,
}

impl OutputQueue {
    pub fn with_hold(hold: usize) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    pub fn push(&mut self, item: PipelineItem) {
        self.items.push_back(item);
    }

    pub fn drain(&mut self, sync: bool) -> Vec<PipelineItem> {
        let ready = if sync {
            self.items.len()
        } else {
            self.items.len().saturating_sub(self.hold)
        };
        self.emitted += ready as u64;
        self.items.drain(..ready).collect()
    }

    pub fn set_hold(&mut self, hold: usize) {
        self.hold = hold;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// One node of the linear processing chain.
///
/// The scheduler hands items in with [`send`](PipelineStage::send) (`None` is the
/// terminal input for this stage) and collects results with
/// [`drain`](PipelineStage::drain). A stage only reports `EndOfStream` once it has no
/// queued output left.
pub trait PipelineStage: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> StageKind;
    fn backend(&self) -> Backend;

    /// Pass-through stages route data without owning pooled buffers.
    fn is_pass_through(&self) -> bool {
        false
    }

    /// Precedence of this stage's shape when a pool is shared with a neighbour.
    fn alloc_priority(&self) -> u32 {
        0
    }

    fn required_input(&self) -> Option<SurfaceRequest> {
        None
    }

    fn required_output(&self) -> Option<SurfaceRequest> {
        None
    }

    fn allocate_output(
        &mut self,
        count: usize,
        shape: FrameShape,
        domain: MemoryDomain,
    ) -> Result<()> {
        let _ = (count, shape, domain);
        Err(PipelineError::Allocation(format!(
            "stage '{}' does not own an output pool",
            self.name()
        )))
    }

    fn send(&mut self, input: Option<PipelineItem>) -> Result<StageStatus>;

    fn drain(&mut self, sync: bool) -> Result<Vec<PipelineItem>>;

    /// Whether handing output to a stage on `next` needs outstanding work completed first.
    fn requires_sync_with(&self, next: Backend) -> bool {
        self.backend() != next
    }

    /// Number of newest outputs that may stay queued when no sync is requested.
    fn set_output_hold(&mut self, hold: usize) {
        let _ = hold;
    }

    /// Items handed downstream so far.
    fn output_count(&self) -> u64;

    /// Frames discarded on purpose (trim ranges, sync corrections).
    fn frames_dropped(&self) -> u64 {
        0
    }

    /// Frames repeated to fill timestamp gaps.
    fn frames_duplicated(&self) -> u64 {
        0
    }

    fn filter_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn has_metric(&self) -> bool {
        false
    }

    fn describe(&self, index: usize) -> StageDescriptor {
        StageDescriptor {
            index,
            name: self.name().to_string(),
            kind: self.kind(),
            backend: self.backend(),
            pass_through: self.is_pass_through(),
            input: self.required_input(),
            output: self.required_output(),
            filters: self.filter_names(),
            metric: self.has_metric(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageDescriptor {
    pub index: usize,
    pub name: String,
    pub kind: StageKind,
    pub backend: Backend,
    pub pass_through: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<SurfaceRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<SurfaceRequest>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub metric: bool,
}
