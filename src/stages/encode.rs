use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::error::{Result, StageStatus};
use crate::hw::{CodecConfig, HwEncoder, PrepConfig, RateControlConfig};
use crate::quality::SharedMetric;
use crate::video::FrameShape;

use super::{
    Backend, OutputQueue, PipelineFrame, PipelineItem, PipelineStage, StageKind, SurfaceRequest,
};

/// Feeds frames to the device encoder and emits finished access units.
///
/// Input frames stay referenced until the encoder reports a unit for them, and the
/// unit's timing is restored from the frame that produced it.
pub struct EncodeStage {
    encoder: Box<dyn HwEncoder>,
    shape: FrameShape,
    queue: OutputQueue,
    in_flight: VecDeque<(u64, PipelineFrame)>,
    timing: HashMap<u64, (i64, i64)>,
    submitted: u64,
    metric: Option<SharedMetric>,
    draining: bool,
}

impl EncodeStage {
    pub fn new(
        mut encoder: Box<dyn HwEncoder>,
        prep: &PrepConfig,
        rate_control: &RateControlConfig,
        codec: &CodecConfig,
    ) -> Result<Self> {
        encoder.apply_prep(prep)?;
        encoder.apply_rate_control(rate_control)?;
        encoder.apply_codec(codec)?;
        debug!(codec = %encoder.codec(), shape = %prep.shape(), "Encoder configured");
        Ok(Self {
            encoder,
            shape: prep.shape(),
            queue: OutputQueue::default(),
            in_flight: VecDeque::new(),
            timing: HashMap::new(),
            submitted: 0,
            metric: None,
            draining: false,
        })
    }

    pub fn with_metric(mut self, metric: SharedMetric) -> Self {
        self.metric = Some(metric);
        self
    }

    fn collect(&mut self) -> Result<()> {
        while let Some(mut unit) = self.encoder.receive()? {
            while let Some((index, _)) = self.in_flight.front()
                && *index <= unit.frame_index
            {
                self.in_flight.pop_front();
            }
            if let Some((pts, duration)) = self.timing.remove(&unit.frame_index) {
                unit.pts = pts;
                unit.duration = duration;
            }
            trace!(index = unit.frame_index, pts = unit.pts, bytes = unit.size(), "Unit encoded");
            if let Some(metric) = &self.metric {
                metric.lock().add_encoded(&unit)?;
            }
            self.queue.push(PipelineItem::Bitstream(unit));
        }
        Ok(())
    }
}

impl PipelineStage for EncodeStage {
    fn name(&self) -> &str {
        "encode"
    }

    fn kind(&self) -> StageKind {
        StageKind::Encode
    }

    fn backend(&self) -> Backend {
        Backend::Codec
    }

    fn alloc_priority(&self) -> u32 {
        2
    }

    fn required_input(&self) -> Option<SurfaceRequest> {
        Some(SurfaceRequest::new(self.shape, self.encoder.input_slack()))
    }

    fn send(&mut self, input: Option<PipelineItem>) -> Result<StageStatus> {
        let Some(item) = input else {
            if !self.draining {
                self.encoder.submit(None)?;
                self.draining = true;
            }
            self.collect()?;
            if !self.queue.is_empty() {
                return Ok(StageStatus::Ok);
            }
            if let Some(metric) = &self.metric {
                metric.lock().finish()?;
            }
            return Ok(StageStatus::EndOfStream);
        };
        let frame = item.into_frame(self.name())?;
        let index = self.submitted;
        self.submitted += 1;
        let mut meta = frame.meta.clone();
        meta.input_frame_id = index;
        self.timing.insert(index, (meta.timestamp, meta.duration));
        {
            let buffer = frame.handle.lock();
            self.encoder.submit(Some((&buffer, &meta)))?;
        }
        self.in_flight.push_back((index, frame));
        self.collect()?;
        Ok(if self.queue.is_empty() {
            StageStatus::NeedMoreInput
        } else {
            StageStatus::Ok
        })
    }

    fn drain(&mut self, sync: bool) -> Result<Vec<PipelineItem>> {
        self.collect()?;
        Ok(self.queue.drain(sync))
    }

    fn set_output_hold(&mut self, hold: usize) {
        self.queue.set_hold(hold);
    }

    fn output_count(&self) -> u64 {
        self.queue.emitted()
    }

    fn has_metric(&self) -> bool {
        self.metric.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{HwDevice, ReferenceDevice};
    use crate::job::EncoderParams;
    use crate::pool::FrameBufferPool;
    use crate::quality::QualityMetric;
    use crate::source::InputInfo;
    use crate::video::{FrameMeta, MemoryDomain, PixelFormat, Rational, VideoCodec};

    fn raw_stage(device: &ReferenceDevice, shape: FrameShape, fps: Rational) -> EncodeStage {
        let params = EncoderParams {
            codec: Some(VideoCodec::Raw),
            ..EncoderParams::default()
        };
        EncodeStage::new(
            device.open_encoder(VideoCodec::Raw).unwrap(),
            &PrepConfig::new(shape, 0, fps.inv()).unwrap(),
            &RateControlConfig::from_params(&params, fps),
            &CodecConfig::Raw,
        )
        .unwrap()
    }

    #[test]
    fn units_carry_source_timing_and_release_frames() {
        let shape = FrameShape::new(4, 4, PixelFormat::Nv12);
        let device = ReferenceDevice::new().with_encoder_delay(1);
        let mut stage = raw_stage(&device, shape, Rational::new(30, 1));
        assert_eq!(stage.required_input().unwrap().count, 2);

        let mut pool = FrameBufferPool::new("enc-test");
        pool.allocate(3, shape, MemoryDomain::Codec).unwrap();
        let mut units = Vec::new();
        for index in 0..3u64 {
            let frame = PipelineFrame::new(
                pool.checkout().unwrap(),
                FrameMeta::new(100 + index as i64 * 10, 10, 40 + index),
            );
            stage.send(Some(PipelineItem::Frame(frame))).unwrap();
            units.extend(stage.drain(true).unwrap());
        }
        // One unit is still inside the encoder, holding one frame.
        assert_eq!(units.len(), 2);
        assert_eq!(pool.available(), 2);
        while stage.send(None).unwrap() != StageStatus::EndOfStream {
            units.extend(stage.drain(true).unwrap());
        }
        assert_eq!(pool.available(), 3);
        let stamps: Vec<(i64, i64, u64)> = units
            .into_iter()
            .map(|item| match item {
                PipelineItem::Bitstream(unit) => (unit.pts, unit.duration, unit.frame_index),
                PipelineItem::Frame(_) => panic!("encoder emitted a frame"),
            })
            .collect();
        assert_eq!(stamps, vec![(100, 10, 0), (110, 10, 1), (120, 10, 2)]);
    }

    #[test]
    fn end_of_stream_finishes_the_quality_metric() {
        let shape = FrameShape::new(4, 4, PixelFormat::Nv12);
        let fps = Rational::new(30, 1);
        let device = ReferenceDevice::new().with_encoder_delay(1);
        let decoder = device
            .open_decoder(VideoCodec::Raw, &InputInfo::raw(shape, fps))
            .unwrap();
        let metric = QualityMetric::new(decoder).unwrap().shared();
        let mut stage = raw_stage(&device, shape, fps).with_metric(metric.clone());

        let mut pool = FrameBufferPool::new("enc-metric");
        pool.allocate(4, shape, MemoryDomain::Codec).unwrap();
        for index in 0..4u64 {
            let frame = PipelineFrame::new(
                pool.checkout().unwrap(),
                FrameMeta::new(index as i64 * 10, 10, index),
            );
            metric.lock().add_reference(&frame).unwrap();
            // The last picture never reaches the encoder.
            if index < 3 {
                stage.send(Some(PipelineItem::Frame(frame))).unwrap();
                stage.drain(true).unwrap();
            }
        }
        while stage.send(None).unwrap() != StageStatus::EndOfStream {
            stage.drain(true).unwrap();
        }

        let summary = metric.lock().summary();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.unmatched, 1);
    }
}
