use std::collections::VecDeque;

use tracing::debug;

use crate::error::{PipelineError, Result, StageStatus};
use crate::filters::Filter;
use crate::pool::FrameBufferPool;
use crate::quality::SharedMetric;
use crate::video::{FrameShape, MemoryDomain};

use super::{
    Backend, OutputQueue, PipelineFrame, PipelineItem, PipelineStage, StageKind, SurfaceRequest,
};

/// Consecutive filters on one backend, run back to back without a sync point.
///
/// Each filter produces into its own pool. The last filter that does not overwrite
/// in place writes into the block's output pool, which the allocation planner sizes;
/// filters after it only use that pool for copy-on-write.
pub struct FilterBlockStage {
    name: String,
    backend: Backend,
    filters: Vec<Box<dyn Filter>>,
    pools: Vec<FrameBufferPool>,
    output_index: usize,
    burst: usize,
    queue: OutputQueue,
    pending: VecDeque<Option<PipelineFrame>>,
    metric: Option<SharedMetric>,
    flushed: bool,
}

fn domain_for(backend: Backend) -> MemoryDomain {
    match backend {
        Backend::Compute => MemoryDomain::GpuImage,
        Backend::FixedFunction | Backend::Codec => MemoryDomain::Codec,
        Backend::Host => MemoryDomain::System,
    }
}

impl FilterBlockStage {
    pub fn new(name: impl Into<String>, backend: Backend, filters: Vec<Box<dyn Filter>>) -> Result<Self> {
        let name = name.into();
        if filters.is_empty() {
            return Err(PipelineError::InvalidOperation(format!(
                "filter block '{name}' has no filters"
            )));
        }
        let output_index = filters
            .iter()
            .rposition(|filter| !filter.overwrites_in_place())
            .unwrap_or(filters.len() - 1);
        let burst = filters
            .iter()
            .map(|filter| filter.max_outputs().max(1))
            .product::<usize>();

        let mut pools = Vec::with_capacity(filters.len());
        for (index, filter) in filters.iter().enumerate() {
            let mut pool = FrameBufferPool::new(format!("{name}/{}", filter.kind()));
            if index != output_index {
                let later_retained: usize = filters[index + 1..]
                    .iter()
                    .map(|f| f.retained_frames())
                    .sum();
                let fan_out: usize = filters[index..]
                    .iter()
                    .map(|f| f.max_outputs().max(1))
                    .product();
                let count = later_retained + filter.retained_frames() + fan_out + 2;
                pool.allocate(count, filter.output_shape(), domain_for(backend))?;
            }
            pools.push(pool);
        }
        debug!(
            block = %name,
            %backend,
            filters = ?filters.iter().map(|f| f.kind().name()).collect::<Vec<_>>(),
            "Filter block created"
        );
        Ok(Self {
            name,
            backend,
            filters,
            pools,
            output_index,
            burst,
            queue: OutputQueue::with_hold(1),
            pending: VecDeque::new(),
            metric: None,
            flushed: false,
        })
    }

    /// Registers every emitted frame as a quality reference.
    pub fn with_metric(mut self, metric: SharedMetric) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn filters(&self) -> &[Box<dyn Filter>] {
        &self.filters
    }

    fn run_chain(&mut self, input: Option<PipelineFrame>) -> Result<Vec<PipelineFrame>> {
        let Self {
            filters,
            pools,
            output_index,
            ..
        } = self;
        let mut current = vec![input];
        for (index, filter) in filters.iter_mut().enumerate() {
            let pool = &pools[index.min(*output_index)];
            let mut next = Vec::with_capacity(current.len());
            for item in current {
                let terminal = item.is_none();
                next.extend(filter.transform(item, pool)?.into_iter().map(Some));
                if terminal {
                    next.push(None);
                }
            }
            current = next;
        }
        Ok(current.into_iter().flatten().collect())
    }

    fn process_pending(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            if self.pools[self.output_index].available() < self.burst {
                break;
            }
            let Some(input) = self.pending.pop_front() else {
                break;
            };
            for frame in self.run_chain(input)? {
                if let Some(metric) = &self.metric {
                    metric.lock().add_reference(&frame)?;
                }
                self.queue.push(PipelineItem::Frame(frame));
            }
        }
        Ok(())
    }
}

impl PipelineStage for FilterBlockStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::FilterBlock
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    fn required_input(&self) -> Option<SurfaceRequest> {
        let first = &self.filters[0];
        Some(SurfaceRequest::new(
            first.input_shape(),
            first.retained_frames() + 1,
        ))
    }

    fn required_output(&self) -> Option<SurfaceRequest> {
        let last = self.filters.last()?;
        Some(SurfaceRequest::new(last.output_shape(), self.burst))
    }

    fn allocate_output(&mut self, count: usize, shape: FrameShape, domain: MemoryDomain) -> Result<()> {
        self.pools[self.output_index].allocate(count, shape, domain)
    }

    fn send(&mut self, input: Option<PipelineItem>) -> Result<StageStatus> {
        let terminal = input.is_none();
        match input {
            Some(item) => {
                let frame = item.into_frame(&self.name)?;
                self.pending.push_back(Some(frame));
            }
            None if !self.flushed => {
                self.pending.push_back(None);
                self.flushed = true;
            }
            None => {}
        }
        self.process_pending()?;
        let status = if !self.queue.is_empty() {
            StageStatus::Ok
        } else if !self.pending.is_empty() {
            StageStatus::NeedMoreSlots
        } else if terminal {
            StageStatus::EndOfStream
        } else {
            StageStatus::NeedMoreInput
        };
        Ok(status)
    }

    fn drain(&mut self, sync: bool) -> Result<Vec<PipelineItem>> {
        self.process_pending()?;
        Ok(self.queue.drain(sync))
    }

    fn set_output_hold(&mut self, hold: usize) {
        self.queue.set_hold(hold);
    }

    fn output_count(&self) -> u64 {
        self.queue.emitted()
    }

    fn filter_names(&self) -> Vec<String> {
        self.filters
            .iter()
            .map(|filter| filter.kind().to_string())
            .collect()
    }

    fn has_metric(&self) -> bool {
        self.metric.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{ConvertFilter, DenoiseFilter, DenoiseMode, TweakFilter};
    use crate::filters::adjust::TweakParams;
    use crate::video::{Crop, FrameMeta, PixelFormat};

    fn nv12_input(count: usize) -> (FrameBufferPool, FrameShape) {
        let shape = FrameShape::new(8, 8, PixelFormat::Nv12);
        let mut pool = FrameBufferPool::new("upstream");
        pool.allocate(count, shape, MemoryDomain::Codec).unwrap();
        (pool, shape)
    }

    fn frame(pool: &FrameBufferPool, index: u64) -> PipelineItem {
        let handle = pool.checkout().unwrap();
        handle.lock().fill(100, 128, 128);
        PipelineItem::Frame(PipelineFrame::new(handle, FrameMeta::new(index as i64, 1, index)))
    }

    fn compute_block(shape: FrameShape) -> FilterBlockStage {
        let entry = ConvertFilter::new(shape, PixelFormat::Yuv420, 8, Crop::default()).unwrap();
        let planar = entry.output_shape();
        let smooth = DenoiseFilter::new(planar, DenoiseMode::Smooth { radius: 1 });
        let exit = ConvertFilter::new(planar, PixelFormat::P010, 10, Crop::default()).unwrap();
        let filters: Vec<Box<dyn Filter>> = vec![Box::new(entry), Box::new(smooth), Box::new(exit)];
        FilterBlockStage::new("vpp-compute-0", Backend::Compute, filters).unwrap()
    }

    #[test]
    fn block_declares_edges_and_converts_through_chain() {
        let (upstream, shape) = nv12_input(2);
        let mut block = compute_block(shape);
        assert_eq!(block.required_input().unwrap().shape.format, PixelFormat::Nv12);
        let out = block.required_output().unwrap();
        assert_eq!((out.shape.format, out.shape.bit_depth), (PixelFormat::P010, 10));
        block
            .allocate_output(3, out.shape, MemoryDomain::GpuImage)
            .unwrap();
        assert_eq!(block.filter_names(), vec!["convert", "smooth", "convert"]);

        assert_eq!(block.send(Some(frame(&upstream, 0))).unwrap(), StageStatus::Ok);
        // The newest output is held back until a sync or the next frame.
        assert!(block.drain(false).unwrap().is_empty());
        let items = block.drain(true).unwrap();
        assert_eq!(items.len(), 1);
        let out = items.into_iter().next().unwrap().into_frame("test").unwrap();
        let buf = out.handle.lock();
        assert_eq!(buf.shape().format, PixelFormat::P010);
        assert_eq!(buf.sample(0, 3, 3), 400);
        assert_eq!(upstream.available(), 2);
    }

    #[test]
    fn full_output_pool_defers_work() {
        let (upstream, shape) = nv12_input(3);
        let mut block = compute_block(shape);
        let out = block.required_output().unwrap();
        block
            .allocate_output(1, out.shape, MemoryDomain::GpuImage)
            .unwrap();
        block.set_output_hold(0);
        block.send(Some(frame(&upstream, 0))).unwrap();
        let first = block.drain(true).unwrap();
        assert_eq!(block.send(Some(frame(&upstream, 1))).unwrap(), StageStatus::NeedMoreSlots);
        drop(first);
        assert_eq!(block.drain(true).unwrap().len(), 1);
        assert_eq!(block.send(None).unwrap(), StageStatus::EndOfStream);
    }

    #[test]
    fn in_place_tail_writes_into_upstream_buffer() {
        let shape = FrameShape::new(8, 8, PixelFormat::Yuv420);
        let mut upstream = FrameBufferPool::new("upstream");
        upstream.allocate(1, shape, MemoryDomain::GpuImage).unwrap();
        let tweak = TweakFilter::new(
            shape,
            &TweakParams {
                brightness: 0.1,
                ..TweakParams::default()
            },
        );
        let filters: Vec<Box<dyn Filter>> = vec![Box::new(tweak)];
        let mut block = FilterBlockStage::new("vpp-compute-0", Backend::Compute, filters).unwrap();
        block.allocate_output(2, shape, MemoryDomain::GpuImage).unwrap();
        let handle = upstream.checkout().unwrap();
        handle.lock().fill(100, 128, 128);
        let slot = handle.slot_index();
        block
            .send(Some(PipelineItem::Frame(PipelineFrame::new(handle, FrameMeta::default()))))
            .unwrap();
        let out = block.drain(true).unwrap().into_iter().next().unwrap().into_frame("test").unwrap();
        assert_eq!(out.handle.slot_index(), slot);
        assert!(out.handle.lock().sample(0, 0, 0) > 100);
    }
}
