use tracing::debug;

use crate::error::{PipelineError, Result, StageStatus};
use crate::hw::HwDecoder;
use crate::pool::FrameBufferPool;
use crate::source::SharedSource;
use crate::video::{FrameShape, MemoryDomain};

use super::{
    Backend, OutputQueue, PipelineFrame, PipelineItem, PipelineStage, StageKind, SurfaceRequest,
};

fn expect_terminal(stage: &str, input: Option<PipelineItem>) -> Result<()> {
    match input {
        None => Ok(()),
        Some(_) => Err(PipelineError::stage(
            stage,
            "input stages do not accept upstream items",
        )),
    }
}

/// Reads raw pictures from the source into its own pool.
pub struct InputStage {
    source: SharedSource,
    shape: FrameShape,
    pool: FrameBufferPool,
    queue: OutputQueue,
    frames_read: u64,
    stop_after: Option<u64>,
    finished: bool,
}

impl InputStage {
    pub fn new(source: SharedSource) -> Self {
        let (shape, stop_after) = {
            let source = source.lock();
            (source.info().shape, source.trim().and_then(|trim| trim.last_kept()))
        };
        Self {
            source,
            shape,
            pool: FrameBufferPool::new("input"),
            queue: OutputQueue::default(),
            frames_read: 0,
            stop_after,
            finished: false,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn finished_status(&self) -> StageStatus {
        if self.queue.is_empty() {
            StageStatus::EndOfStream
        } else {
            StageStatus::Ok
        }
    }
}

impl PipelineStage for InputStage {
    fn name(&self) -> &str {
        "input"
    }

    fn kind(&self) -> StageKind {
        StageKind::Input
    }

    fn backend(&self) -> Backend {
        Backend::Host
    }

    fn required_output(&self) -> Option<SurfaceRequest> {
        Some(SurfaceRequest::new(self.shape, 1))
    }

    fn allocate_output(&mut self, count: usize, shape: FrameShape, domain: MemoryDomain) -> Result<()> {
        self.pool.allocate(count, shape, domain)
    }

    fn send(&mut self, input: Option<PipelineItem>) -> Result<StageStatus> {
        expect_terminal(self.name(), input)?;
        if self.finished {
            return Ok(self.finished_status());
        }
        if let Some(last) = self.stop_after
            && self.frames_read > last
        {
            debug!(frames = self.frames_read, "Input stopped after the last trimmed frame");
            self.finished = true;
            return Ok(self.finished_status());
        }
        let Some(handle) = self.pool.checkout() else {
            return Ok(StageStatus::NeedMoreSlots);
        };
        let meta = {
            let mut buffer = handle.lock();
            self.source.lock().read_frame(&mut buffer)?
        };
        match meta {
            Some(mut meta) => {
                meta.input_frame_id = self.frames_read;
                self.frames_read += 1;
                self.queue.push(PipelineItem::Frame(PipelineFrame::new(handle, meta)));
                Ok(StageStatus::Ok)
            }
            None => {
                debug!(frames = self.frames_read, "Input reached end of stream");
                self.finished = true;
                Ok(self.finished_status())
            }
        }
    }

    fn drain(&mut self, sync: bool) -> Result<Vec<PipelineItem>> {
        Ok(self.queue.drain(sync))
    }

    fn set_output_hold(&mut self, hold: usize) {
        self.queue.set_hold(hold);
    }

    fn output_count(&self) -> u64 {
        self.queue.emitted()
    }
}

/// Pulls access units from the source and decodes them on the device decoder.
pub struct DecodeStage {
    source: SharedSource,
    decoder: Box<dyn HwDecoder>,
    pool: FrameBufferPool,
    queue: OutputQueue,
    packets_read: u64,
    frames_decoded: u64,
    stop_after: Option<u64>,
    input_done: bool,
}

impl DecodeStage {
    pub fn new(source: SharedSource, decoder: Box<dyn HwDecoder>) -> Self {
        let stop_after = source.lock().trim().and_then(|trim| trim.last_kept());
        Self {
            source,
            decoder,
            pool: FrameBufferPool::new("decode"),
            queue: OutputQueue::with_hold(1),
            packets_read: 0,
            frames_decoded: 0,
            stop_after,
            input_done: false,
        }
    }

    fn collect(&mut self) -> Result<()> {
        while self.decoder.pending() > 0 {
            let Some(handle) = self.pool.checkout() else {
                break;
            };
            let meta = {
                let mut buffer = handle.lock();
                self.decoder.receive(&mut buffer)?
            };
            let Some(mut meta) = meta else {
                break;
            };
            meta.input_frame_id = self.frames_decoded;
            self.frames_decoded += 1;
            self.queue.push(PipelineItem::Frame(PipelineFrame::new(handle, meta)));
        }
        Ok(())
    }

    fn read_packet(&mut self) -> Result<()> {
        if let Some(last) = self.stop_after
            && self.packets_read > last
        {
            self.decoder.submit(None)?;
            self.input_done = true;
            return Ok(());
        }
        let packet = self.source.lock().read_packet()?;
        match packet {
            Some(unit) => {
                self.decoder.submit(Some(&unit))?;
                self.packets_read += 1;
            }
            None => {
                debug!(packets = self.packets_read, "Decoder input reached end of stream");
                self.decoder.submit(None)?;
                self.input_done = true;
            }
        }
        Ok(())
    }
}

impl PipelineStage for DecodeStage {
    fn name(&self) -> &str {
        "decode"
    }

    fn kind(&self) -> StageKind {
        StageKind::Decode
    }

    fn backend(&self) -> Backend {
        Backend::Codec
    }

    fn alloc_priority(&self) -> u32 {
        1
    }

    fn required_output(&self) -> Option<SurfaceRequest> {
        Some(SurfaceRequest::new(
            self.decoder.output_shape(),
            self.decoder.surface_slack(),
        ))
    }

    fn allocate_output(&mut self, count: usize, shape: FrameShape, domain: MemoryDomain) -> Result<()> {
        self.pool.allocate(count, shape, domain)
    }

    fn send(&mut self, input: Option<PipelineItem>) -> Result<StageStatus> {
        expect_terminal(self.name(), input)?;
        self.collect()?;
        if !self.input_done && self.decoder.pending() <= self.decoder.surface_slack() {
            self.read_packet()?;
            self.collect()?;
        }
        let drained = self.input_done && self.decoder.pending() == 0;
        if drained {
            // Nothing is in flight any more, so held output is final.
            self.queue.set_hold(0);
        }
        let status = if !self.queue.is_empty() {
            StageStatus::Ok
        } else if drained {
            StageStatus::EndOfStream
        } else if self.decoder.pending() > 0 && self.pool.available() == 0 {
            StageStatus::NeedMoreSlots
        } else {
            StageStatus::NeedMoreInput
        };
        Ok(status)
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
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::source::{RawFileSource, shared};
    use crate::video::{Crop, PixelFormat, Rational, TrimParam, TrimRange};

    fn source(frames: usize) -> SharedSource {
        let shape = FrameShape::new(4, 2, PixelFormat::Yuv420);
        let bytes = vec![7u8; frames * 12];
        shared(
            RawFileSource::from_reader(
                Box::new(Cursor::new(bytes)),
                "mem",
                shape,
                Rational::new(25, 1),
                Crop::default(),
            )
            .unwrap(),
        )
    }

    fn stage(source: SharedSource, count: usize) -> InputStage {
        let mut stage = InputStage::new(source);
        let request = stage.required_output().unwrap();
        stage
            .allocate_output(count, request.shape, MemoryDomain::System)
            .unwrap();
        stage
    }

    #[test]
    fn input_reports_backpressure_then_end_of_stream() {
        let mut stage = stage(source(3), 1);
        assert_eq!(stage.send(None).unwrap(), StageStatus::Ok);
        let held = stage.drain(true).unwrap();
        assert_eq!(stage.send(None).unwrap(), StageStatus::NeedMoreSlots);
        drop(held);
        assert_eq!(stage.send(None).unwrap(), StageStatus::Ok);
        stage.drain(true).unwrap();
        assert_eq!(stage.send(None).unwrap(), StageStatus::Ok);
        stage.drain(true).unwrap();
        assert_eq!(stage.send(None).unwrap(), StageStatus::EndOfStream);
        assert_eq!(stage.frames_read(), 3);
    }

    #[test]
    fn input_stops_after_last_trimmed_frame() {
        let src = source(10);
        src.lock()
            .set_trim(TrimParam::new(vec![TrimRange { start: 1, end: 2 }], 0).unwrap());
        let mut stage = stage(src, 4);
        let mut read = 0;
        while stage.send(None).unwrap() != StageStatus::EndOfStream {
            read += stage.drain(true).unwrap().len();
        }
        assert_eq!(read, 3);
    }
}
