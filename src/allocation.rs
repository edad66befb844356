use serde::Serialize;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::stages::{Backend, PipelineStage, SurfaceRequest};
use crate::video::{FrameShape, MemoryDomain};

/// Extra buffers for compute producers, which may emit several frames per input.
const COMPUTE_SLACK: usize = 4;

/// One pool, owned by `producer` and read by `consumer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolPlan {
    pub producer: usize,
    pub producer_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<usize>,
    pub shape: FrameShape,
    pub count: usize,
    pub domain: MemoryDomain,
}

pub fn pool_size(
    producer_slack: usize,
    consumer_slack: usize,
    async_depth: usize,
    compute_producer: bool,
) -> usize {
    let base = (producer_slack + consumer_slack + async_depth + 1).max(1);
    if compute_producer {
        base + COMPUTE_SLACK
    } else {
        base
    }
}

pub fn pool_domain(producer: Backend, consumer: Option<Backend>) -> MemoryDomain {
    let consumer = consumer.unwrap_or(Backend::Host);
    if (producer == Backend::Compute && !consumer.is_hardware())
        || (consumer == Backend::Compute && !producer.is_hardware())
    {
        MemoryDomain::GpuImage
    } else if producer.is_hardware() && consumer.is_hardware() {
        MemoryDomain::Codec
    } else {
        MemoryDomain::System
    }
}

/// Sizes the buffer pool between every pair of adjacent active stages.
#[derive(Debug, Clone, Copy)]
pub struct AllocationPlanner {
    async_depth: usize,
}

impl AllocationPlanner {
    pub fn new(async_depth: usize) -> Self {
        Self { async_depth }
    }

    pub fn plan(&self, stages: &[Box<dyn PipelineStage>]) -> Result<Vec<PoolPlan>> {
        let active: Vec<usize> = stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| !stage.is_pass_through())
            .map(|(index, _)| index)
            .collect();

        let mut plans = Vec::new();
        for (position, &producer_index) in active.iter().enumerate() {
            let producer = &stages[producer_index];
            let Some(output) = producer.required_output() else {
                continue;
            };
            let consumer_index = active.get(position + 1).copied();
            let consumer = consumer_index.map(|index| &stages[index]);
            let input = consumer.and_then(|stage| stage.required_input());

            let shape = match (consumer, input) {
                (Some(consumer), Some(input)) => {
                    reconcile(producer.as_ref(), output, consumer.as_ref(), input)?
                }
                _ => output.shape,
            };
            let consumer_slack = input.map_or(0, |request| request.count);
            let count = pool_size(
                output.count,
                consumer_slack,
                self.async_depth,
                producer.backend() == Backend::Compute,
            );
            let domain = pool_domain(producer.backend(), consumer.map(|stage| stage.backend()));
            debug!(
                producer = producer.name(),
                consumer = consumer.map(|stage| stage.name()).unwrap_or("sink"),
                %shape,
                count,
                %domain,
                "Pool planned"
            );
            plans.push(PoolPlan {
                producer: producer_index,
                producer_name: producer.name().to_string(),
                consumer: consumer_index,
                shape,
                count,
                domain,
            });
        }
        Ok(plans)
    }

    /// Plans and allocates every pool. Runs once per pipeline.
    pub fn allocate(&self, stages: &mut [Box<dyn PipelineStage>]) -> Result<Vec<PoolPlan>> {
        let plans = self.plan(stages)?;
        for plan in &plans {
            stages[plan.producer].allocate_output(plan.count, plan.shape, plan.domain)?;
        }
        Ok(plans)
    }
}

/// Shape of the pool between two stages: the higher-priority side's shape, widened
/// to fit both.
fn reconcile(
    producer: &dyn PipelineStage,
    output: SurfaceRequest,
    consumer: &dyn PipelineStage,
    input: SurfaceRequest,
) -> Result<FrameShape> {
    if output.shape.format != input.shape.format || output.shape.bit_depth != input.shape.bit_depth
    {
        return Err(PipelineError::InvalidOperation(format!(
            "'{}' produces {} but '{}' expects {}",
            producer.name(),
            output.shape,
            consumer.name(),
            input.shape
        )));
    }
    let mut shape = if consumer.alloc_priority() > producer.alloc_priority() {
        input.shape
    } else {
        output.shape
    };
    shape.width = output.shape.width.max(input.shape.width);
    shape.height = output.shape.height.max(input.shape.height);
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageStatus;
    use crate::stages::{PipelineItem, StageKind};
    use crate::video::PixelFormat;

    struct Fake {
        name: &'static str,
        backend: Backend,
        pass_through: bool,
        priority: u32,
        input: Option<SurfaceRequest>,
        output: Option<SurfaceRequest>,
    }

    impl Fake {
        fn new(name: &'static str, backend: Backend) -> Self {
            Self {
                name,
                backend,
                pass_through: false,
                priority: 0,
                input: None,
                output: None,
            }
        }

        fn input(mut self, shape: FrameShape, count: usize) -> Self {
            self.input = Some(SurfaceRequest::new(shape, count));
            self
        }

        fn output(mut self, shape: FrameShape, count: usize) -> Self {
            self.output = Some(SurfaceRequest::new(shape, count));
            self
        }
    }

    impl PipelineStage for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> StageKind {
            StageKind::FilterBlock
        }

        fn backend(&self) -> Backend {
            self.backend
        }

        fn is_pass_through(&self) -> bool {
            self.pass_through
        }

        fn alloc_priority(&self) -> u32 {
            self.priority
        }

        fn required_input(&self) -> Option<SurfaceRequest> {
            self.input
        }

        fn required_output(&self) -> Option<SurfaceRequest> {
            self.output
        }

        fn allocate_output(&mut self, _count: usize, _shape: FrameShape, _domain: MemoryDomain) -> Result<()> {
            Ok(())
        }

        fn send(&mut self, _input: Option<PipelineItem>) -> Result<StageStatus> {
            Ok(StageStatus::EndOfStream)
        }

        fn drain(&mut self, _sync: bool) -> Result<Vec<PipelineItem>> {
            Ok(Vec::new())
        }

        fn output_count(&self) -> u64 {
            0
        }
    }

    fn nv12(width: u32, height: u32) -> FrameShape {
        FrameShape::new(width, height, PixelFormat::Nv12)
    }

    #[test]
    fn pool_is_never_smaller_than_the_slack_formula() {
        for producer_slack in 0..6 {
            for consumer_slack in 0..6 {
                for async_depth in 0..5 {
                    for backend in [Backend::Host, Backend::Codec, Backend::Compute] {
                        let stages: Vec<Box<dyn PipelineStage>> = vec![
                            Box::new(Fake::new("a", backend).output(nv12(16, 16), producer_slack)),
                            Box::new(Fake::new("b", Backend::Codec).input(nv12(16, 16), consumer_slack)),
                        ];
                        let plans = AllocationPlanner::new(async_depth).plan(&stages).unwrap();
                        let floor = (producer_slack + consumer_slack + async_depth + 1).max(1);
                        assert!(plans[0].count >= floor);
                        if backend == Backend::Compute {
                            assert_eq!(plans[0].count, floor + 4);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn pass_through_stages_are_skipped_when_pairing() {
        let mut trim = Fake::new("trim", Backend::Host);
        trim.pass_through = true;
        trim.output = Some(SurfaceRequest::new(nv12(8, 8), 50));
        let mut stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(Fake::new("input", Backend::Host).output(nv12(16, 16), 1)),
            Box::new(trim),
            Box::new(Fake::new("vpp", Backend::Compute).input(nv12(16, 16), 2)),
        ];
        let plans = AllocationPlanner::new(3).allocate(&mut stages).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!((plans[0].producer, plans[0].consumer), (0, Some(2)));
        assert_eq!(plans[0].count, 1 + 2 + 3 + 1);
        assert_eq!(plans[0].domain, MemoryDomain::GpuImage);
    }

    #[test]
    fn higher_priority_shape_wins_and_sizes_widen() {
        let mut encoder = Fake::new("encode", Backend::Codec).input(nv12(64, 32), 3);
        encoder.priority = 2;
        let interlaced = nv12(48, 40).with_pic_struct(crate::video::PicStruct::Tff);
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(Fake::new("decode", Backend::Codec).output(interlaced, 1)),
            Box::new(encoder),
        ];
        let plans = AllocationPlanner::new(0).plan(&stages).unwrap();
        let shape = plans[0].shape;
        assert_eq!((shape.width, shape.height), (64, 40));
        assert_eq!(shape.pic_struct, crate::video::PicStruct::Progressive);
        assert_eq!(plans[0].domain, MemoryDomain::Codec);
    }

    #[test]
    fn format_mismatch_is_rejected() {
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(Fake::new("vpp", Backend::Compute).output(FrameShape::new(8, 8, PixelFormat::Yuv420), 1)),
            Box::new(Fake::new("encode", Backend::Codec).input(nv12(8, 8), 1)),
        ];
        let err = AllocationPlanner::new(3).plan(&stages).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOperation(_)));
    }

    #[test]
    fn last_producer_gets_no_consumer_slack() {
        let mut stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(Fake::new("input", Backend::Host).output(nv12(8, 8), 1)),
        ];
        let plans = AllocationPlanner::new(3).allocate(&mut stages).unwrap();
        assert_eq!(plans[0].consumer, None);
        assert_eq!(plans[0].count, 5);
        assert_eq!(plans[0].domain, MemoryDomain::System);
    }

    #[test]
    fn domain_rule() {
        use Backend::*;
        assert_eq!(pool_domain(Compute, Some(Host)), MemoryDomain::GpuImage);
        assert_eq!(pool_domain(Host, Some(Compute)), MemoryDomain::GpuImage);
        assert_eq!(pool_domain(Codec, Some(Compute)), MemoryDomain::System);
        assert_eq!(pool_domain(Codec, Some(FixedFunction)), MemoryDomain::Codec);
        assert_eq!(pool_domain(Host, None), MemoryDomain::System);
    }
}
