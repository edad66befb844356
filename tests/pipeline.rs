use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hwtranscode::error::PipelineError;
use hwtranscode::hw::ReferenceDevice;
use hwtranscode::job::TranscodeJob;
use hwtranscode::observability::MetricsCollector;
use hwtranscode::pipeline::build_pipeline;
use hwtranscode::scheduler::{CancelToken, RunState, Scheduler};
use hwtranscode::sink::MemorySink;
use hwtranscode::source::{
    InputInfo, RawFileSource, SharedSource, VideoSource, shared,
};
use hwtranscode::stages::StageKind;
use hwtranscode::video::{Crop, FrameBuffer, FrameMeta, FrameShape, PixelFormat, Rational, TrimParam};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 32;

fn job(extra: &str) -> TranscodeJob {
    job_with_format("nv12", extra)
}

fn job_with_format(format: &str, extra: &str) -> TranscodeJob {
    TranscodeJob::from_yaml(&format!(
        "version: 1\ninputs: [{{ path: in.yuv }}]\noutput: {{ directory: out }}\n\
         input: {{ width: {WIDTH}, height: {HEIGHT}, format: {format} }}\n{extra}"
    ))
    .unwrap()
}

/// Frames with a moving luma gradient and flat chroma.
fn raw_frames(shape: FrameShape, frames: usize) -> Vec<u8> {
    let bytes_per_sample = if shape.bit_depth > 8 { 2 } else { 1 };
    let luma = (shape.width * shape.height) as usize;
    let mut data = Vec::new();
    for frame in 0..frames {
        for i in 0..luma {
            let value = ((i + frame * 3) % 200 + 16) as u16;
            if bytes_per_sample == 2 {
                data.extend_from_slice(&(value << 8).to_le_bytes());
            } else {
                data.push(value as u8);
            }
        }
        for _ in 0..luma / 2 {
            if bytes_per_sample == 2 {
                data.extend_from_slice(&(128u16 << 8).to_le_bytes());
            } else {
                data.push(128);
            }
        }
    }
    data
}

fn raw_source(shape: FrameShape, frames: usize) -> RawFileSource {
    RawFileSource::from_reader(
        Box::new(Cursor::new(raw_frames(shape, frames))),
        "memory",
        shape,
        Rational::new(30, 1),
        Crop::default(),
    )
    .unwrap()
}

fn nv12() -> FrameShape {
    FrameShape::new(WIDTH, HEIGHT, PixelFormat::Nv12)
}

fn scheduler(cancel: CancelToken) -> Scheduler {
    Scheduler::new(cancel).with_metrics(MetricsCollector::new())
}

/// Cancels the run once a number of pictures has been read.
struct CancellingSource {
    inner: RawFileSource,
    cancel: CancelToken,
    after: usize,
    reads: Arc<AtomicUsize>,
}

impl VideoSource for CancellingSource {
    fn info(&self) -> &InputInfo {
        self.inner.info()
    }

    fn read_frame(&mut self, target: &mut FrameBuffer) -> hwtranscode::Result<Option<FrameMeta>> {
        let meta = self.inner.read_frame(target)?;
        if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.cancel.cancel();
        }
        Ok(meta)
    }

    fn trim(&self) -> Option<&TrimParam> {
        self.inner.trim()
    }

    fn set_trim(&mut self, trim: TrimParam) {
        self.inner.set_trim(trim)
    }

    fn message(&self) -> String {
        format!("cancelling {}", self.inner.message())
    }
}

#[test]
fn raw_nv12_frames_encode_in_order() {
    let job = job("encoder: { codec: raw }\n");
    let source: SharedSource = shared(raw_source(nv12(), 30));
    let mut pipeline = build_pipeline(&job, source, &ReferenceDevice::new()).unwrap();
    let mut sink = MemorySink::new();
    let captured = sink.captured();

    let summary = pipeline
        .run(&mut scheduler(CancelToken::new()), &mut sink)
        .unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.counters.frames_read, 30);
    assert_eq!(summary.counters.units_written, 30);
    let captured = captured.lock();
    assert!(captured.completed);
    assert_eq!(captured.units.len(), 30);
    assert!(captured.units.windows(2).all(|pair| pair[0].pts <= pair[1].pts));
}

#[test]
fn two_deinterlacers_fail_before_allocation() {
    let job = job("encoder: { codec: raw }\nfilters:\n  yadif: {}\n  nnedi: {}\n");
    let err = build_pipeline(&job, shared(raw_source(nv12(), 1)), &ReferenceDevice::new())
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(err.is_construction_error());
}

#[test]
fn compute_block_converts_right_before_encode() {
    let job = job_with_format(
        "p010",
        "encoder: { codec: raw, output_depth: 8 }\nfilters:\n  tweak: { contrast: 1.1 }\n",
    );
    let p010 = FrameShape::new(WIDTH, HEIGHT, PixelFormat::P010);
    let mut pipeline = build_pipeline(&job, shared(raw_source(p010, 4)), &ReferenceDevice::new()).unwrap();

    let descriptors = pipeline.descriptors();
    let encode = descriptors
        .iter()
        .position(|d| d.kind == StageKind::Encode)
        .unwrap();
    assert_eq!(encode, descriptors.len() - 1);
    let block = &descriptors[encode - 1];
    assert_eq!(block.kind, StageKind::FilterBlock);
    assert_eq!(block.filters.last().map(String::as_str), Some("convert"));
    assert_eq!(pipeline.output_shape().format, PixelFormat::Nv12);

    let mut sink = MemorySink::new();
    let captured = sink.captured();
    pipeline
        .run(&mut scheduler(CancelToken::new()), &mut sink)
        .unwrap();
    assert_eq!(captured.lock().units.len(), 4);
}

#[test]
fn cancellation_after_five_frames_aborts() {
    let job = job("encoder: { codec: raw }\n");
    let cancel = CancelToken::new();
    let reads = Arc::new(AtomicUsize::new(0));
    let source = shared(CancellingSource {
        inner: raw_source(nv12(), 30),
        cancel: cancel.clone(),
        after: 5,
        reads: reads.clone(),
    });
    let mut pipeline = build_pipeline(&job, source, &ReferenceDevice::new()).unwrap();
    let mut sink = MemorySink::new();
    let captured = sink.captured();
    let mut scheduler = scheduler(cancel);

    let err = pipeline.run(&mut scheduler, &mut sink).unwrap_err();

    assert!(matches!(err, PipelineError::Aborted));
    assert_eq!(scheduler.state(), RunState::Aborted);
    assert_eq!(reads.load(Ordering::SeqCst), 5);
    assert!(captured.lock().units.len() <= 5);
}

#[test]
fn raw_output_passes_pictures_through() {
    let job = job("");
    let input = raw_frames(nv12(), 6);
    let mut pipeline = build_pipeline(&job, shared(raw_source(nv12(), 6)), &ReferenceDevice::new()).unwrap();
    assert!(
        pipeline
            .descriptors()
            .iter()
            .all(|d| d.kind != StageKind::Encode)
    );

    let mut sink = MemorySink::new();
    let captured = sink.captured();
    pipeline
        .run(&mut scheduler(CancelToken::new()), &mut sink)
        .unwrap();

    let captured = captured.lock();
    assert_eq!(captured.frames.len(), 6);
    assert_eq!(captured.frame_bytes.concat(), input);
}

#[test]
fn trim_keeps_inclusive_range() {
    let job = job("encoder: { codec: raw }\ntrim:\n  ranges:\n    - { start: 10, end: 20 }\n");
    let mut pipeline = build_pipeline(&job, shared(raw_source(nv12(), 30)), &ReferenceDevice::new()).unwrap();
    assert!(
        pipeline
            .descriptors()
            .iter()
            .any(|d| d.kind == StageKind::Trim)
    );

    let mut sink = MemorySink::new();
    let captured = sink.captured();
    pipeline
        .run(&mut scheduler(CancelToken::new()), &mut sink)
        .unwrap();
    assert_eq!(captured.lock().units.len(), 11);
}

#[test]
fn resize_and_sharpen_produce_scaled_units() {
    let job = job(
        "encoder: { codec: raw }\nfilters:\n  resize: { width: 32, height: 16 }\n  unsharp: {}\n",
    );
    let mut pipeline = build_pipeline(&job, shared(raw_source(nv12(), 8)), &ReferenceDevice::new()).unwrap();
    assert_eq!(
        (pipeline.output_shape().width, pipeline.output_shape().height),
        (32, 16)
    );
    assert!(!pipeline.pools().is_empty());

    let mut sink = MemorySink::new();
    let captured = sink.captured();
    let summary = pipeline
        .run(&mut scheduler(CancelToken::new()), &mut sink)
        .unwrap();
    assert_eq!(captured.lock().units.len(), 8);
    assert!(summary.stages.iter().any(|stage| stage.name.starts_with("vpp")));
}

#[test]
fn compute_disabled_rejects_compute_filters() {
    let job = job("encoder: { codec: raw }\nfilters:\n  deband: {}\ncontrol: { compute: disabled }\n");
    let err = build_pipeline(&job, shared(raw_source(nv12(), 1)), &ReferenceDevice::new())
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::UnsupportedOperation(_)));

    let job = job_required();
    let device = ReferenceDevice::new().with_compute(false);
    let err = build_pipeline(&job, shared(raw_source(nv12(), 1)), &device)
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::UnsupportedOperation(_)));
}

fn job_required() -> TranscodeJob {
    job("encoder: { codec: raw }\ncontrol: { compute: required }\n")
}
