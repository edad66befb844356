use serde::Serialize;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::filters::{FilterContext, FilterRegistry};
use crate::hw::RateControlMode;
use crate::job::{EncoderParams, InputContainer, TranscodeJob, VppParams};
use crate::source::{InputInfo, TimestampQuality};
use crate::stages::{AvSyncMode, Backend};
use crate::video::{ChromaLayout, Crop, FrameShape, PixelFormat, Rational, TrimParam, VideoCodec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Checks a job without opening any input.
pub fn validate_job(job: &TranscodeJob, registry: &FilterRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if job.version != 1 {
        report
            .errors
            .push(format!("Unsupported job version: {}", job.version));
    }

    if job.inputs.is_empty() {
        report
            .errors
            .push("At least one input pattern is required".into());
    }
    for (idx, input) in job.inputs.iter().enumerate() {
        if input.path.trim().is_empty() {
            report
                .errors
                .push("Input path patterns cannot be empty".into());
        } else if let Err(err) = glob::Pattern::new(&input.path) {
            report.errors.push(format!(
                "Input pattern {} ('{}') is not a valid glob: {}",
                idx + 1,
                input.path,
                err
            ));
        }
    }

    if job.output.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    }

    if let Err(err) = check_processing(&job.filters) {
        report.errors.push(err.to_string());
    }
    if let Some(trim) = &job.trim
        && let Err(err) = trim.check()
    {
        report.errors.push(err.to_string());
    }
    if let Err(err) = check_crop(&job.input.crop) {
        report.errors.push(err.to_string());
    }

    if let Some(encoder) = &job.encoder {
        report.merge(validate_encoder(encoder));
    } else if job.metric.enabled {
        report
            .errors
            .push("The quality metric compares encoded output and needs an encoder".into());
    }
    if !job.quality_gates.is_empty() && !job.metric.enabled {
        report
            .errors
            .push("Quality gates require metric.enabled".into());
    }
    if job.sync.mode != AvSyncMode::Cfr && job.input.container == InputContainer::Raw {
        report.warnings.push(format!(
            "Sync mode {:?} needs source timestamps; raw inputs have none",
            job.sync.mode
        ));
    }
    if job.control.async_depth == 0 {
        report
            .warnings
            .push("control.async_depth 0 disables pipelining between stages".into());
    }
    if let Some(max_fps) = job.control.max_fps
        && max_fps <= 0.0
    {
        report
            .errors
            .push(format!("control.max_fps must be positive (got {max_fps})"));
    }

    report.merge(validate_filters(job, registry));
    report
}

fn validate_encoder(encoder: &EncoderParams) -> ValidationReport {
    let mut report = ValidationReport::default();
    if encoder.qp_min > encoder.qp_max {
        report.errors.push(format!(
            "Encoder qp_min {} is above qp_max {}",
            encoder.qp_min, encoder.qp_max
        ));
    }
    if !matches!(encoder.rotation, 0 | 90 | 180 | 270) {
        report.errors.push(format!(
            "Encoder rotation must be 0, 90, 180 or 270 (got {})",
            encoder.rotation
        ));
    }
    match encoder.rate_control {
        RateControlMode::Cqp => {}
        mode => {
            if encoder.bitrate == 0 {
                report
                    .errors
                    .push(format!("Rate control {mode:?} needs a bitrate"));
            }
            if mode == RateControlMode::Vbr && encoder.max_bitrate < encoder.bitrate {
                report.warnings.push(format!(
                    "VBR max_bitrate {} is below the target {}",
                    encoder.max_bitrate, encoder.bitrate
                ));
            }
        }
    }
    if encoder.codec.is_none() {
        report
            .warnings
            .push("No encoder codec given, defaulting to h264".into());
    }
    report
}

/// Instantiates every enabled filter against the declared input size.
fn validate_filters(job: &TranscodeJob, registry: &FilterRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    let input = &job.input;
    let Some((width, height)) = job.input.crop.apply(input.width, input.height) else {
        if input.width != 0 || input.height != 0 {
            report.errors.push(format!(
                "Crop leaves nothing of the {}x{} input",
                input.width, input.height
            ));
        }
        return report;
    };
    let depth = input.bit_depth.unwrap_or_else(|| input.format.default_bit_depth());
    let shape = FrameShape::new(width, height, input.format)
        .with_format(input.format.compute_format(), depth)
        .with_pic_struct(input.pic_struct);
    let ctx = FilterContext {
        input: shape,
        params: &job.filters,
        backend: Backend::Compute,
        resize_to: job.filters.resize.target().unwrap_or((width, height)),
        timebase: input.fps.inv(),
    };
    for kind in job.filters.enabled() {
        if let Err(err) = registry.create(kind, &ctx) {
            report.errors.push(format!("Filter '{kind}': {err}"));
        }
    }
    report
}

/// Rejects contradictory filter selections. Runs before any device is touched.
pub fn check_processing(filters: &VppParams) -> Result<()> {
    let deinterlacers = filters.deinterlacers();
    if deinterlacers.len() > 1 {
        let names: Vec<&str> = deinterlacers.iter().map(|kind| kind.name()).collect();
        return Err(PipelineError::Configuration(format!(
            "only one deinterlacer can be enabled, got {}",
            names.join(", ")
        )));
    }
    Ok(())
}

fn check_crop(crop: &Crop) -> Result<()> {
    if [crop.left, crop.right, crop.top, crop.bottom]
        .iter()
        .any(|edge| edge % 2 != 0)
    {
        return Err(PipelineError::Configuration(format!(
            "crop edges must be even (left {}, right {}, top {}, bottom {})",
            crop.left, crop.right, crop.top, crop.bottom
        )));
    }
    Ok(())
}

/// Job parameters resolved against what the input actually delivers.
#[derive(Debug, Clone)]
pub struct VideoParams {
    pub fps: Rational,
    /// Pictures as the input stage emits them.
    pub source: FrameShape,
    /// Crop the pipeline still has to apply.
    pub crop: Crop,
    pub cropped: (u32, u32),
    pub resize_to: (u32, u32),
    /// Output keeps interlaced fields.
    pub interlaced: bool,
    pub output_format: PixelFormat,
    pub output_depth: u8,
    /// Encoder settings with the codec resolved and quantizers clamped.
    pub encoder: Option<EncoderParams>,
    pub trim: Option<TrimParam>,
    pub timestamp_quality: TimestampQuality,
}

impl VideoParams {
    pub fn codec(&self) -> Option<VideoCodec> {
        self.encoder.as_ref().and_then(|encoder| encoder.codec)
    }

    pub fn output_shape(&self, size: (u32, u32)) -> FrameShape {
        FrameShape::new(size.0, size.1, self.output_format)
            .with_format(self.output_format, self.output_depth)
    }
}

pub fn check_video_params(job: &TranscodeJob, info: &InputInfo) -> Result<VideoParams> {
    let fps = info.fps;
    if !fps.is_valid() {
        return Err(PipelineError::InvalidVideoParam(format!(
            "frame rate {fps} must have a positive numerator and denominator"
        )));
    }
    let fps = fps.reduce();

    let source = info.shape;
    let interlaced_source = source.pic_struct.is_interlaced();
    let height_align = if interlaced_source { 4 } else { 2 };
    if source.width == 0 || source.height == 0 {
        return Err(PipelineError::InvalidVideoParam(format!(
            "input size {}x{} is empty",
            source.width, source.height
        )));
    }
    if source.width % 2 != 0 || source.height % height_align != 0 {
        return Err(PipelineError::InvalidVideoParam(format!(
            "input size {}x{} must have an even width and a height divisible by {height_align}",
            source.width, source.height
        )));
    }

    check_crop(&job.input.crop)?;
    let crop = if info.crop_applied {
        Crop::default()
    } else {
        job.input.crop
    };
    let cropped = crop.apply(source.width, source.height).ok_or_else(|| {
        PipelineError::Configuration(format!(
            "crop {}/{}/{}/{} leaves nothing of a {}x{} input",
            crop.left, crop.right, crop.top, crop.bottom, source.width, source.height
        ))
    })?;

    let interlaced = interlaced_source && job.filters.deinterlacers().is_empty();
    let out_align = if interlaced { 4 } else { 2 };
    let resize_to = job.filters.resize.target().unwrap_or(cropped);
    if resize_to.0 == 0
        || resize_to.1 == 0
        || resize_to.0 % 2 != 0
        || resize_to.1 % out_align != 0
    {
        return Err(PipelineError::Configuration(format!(
            "output size {}x{} must be non-zero with an even width and a height divisible by {out_align}",
            resize_to.0, resize_to.1
        )));
    }

    if let Some(trim) = &job.trim {
        trim.check()?;
    }

    let (encoder, output_format, output_depth) = match &job.encoder {
        None => (None, source.format, source.bit_depth),
        Some(params) => {
            let codec = params.codec.unwrap_or_default();
            let mut depth = params.output_depth.unwrap_or(source.bit_depth);
            if codec == VideoCodec::H264 && depth != 8 {
                debug!(depth, "H.264 output forced to 8 bit");
                depth = 8;
            }
            let format = match source.format.chroma() {
                ChromaLayout::Planar444 => PixelFormat::Yuv444.with_depth(depth),
                _ => PixelFormat::Nv12.with_depth(depth),
            };
            let max_qp = codec.max_qp(depth);
            let mut normalized = params.clone();
            normalized.codec = Some(codec);
            normalized.qp = normalized.qp.min(max_qp);
            normalized.qp_min = normalized.qp_min.min(max_qp);
            normalized.qp_max = normalized.qp_max.min(max_qp);
            (Some(normalized), format, depth)
        }
    };

    Ok(VideoParams {
        fps,
        source,
        crop,
        cropped,
        resize_to,
        interlaced,
        output_format,
        output_depth,
        encoder,
        trim: job.trim.clone(),
        timestamp_quality: info.timestamp_quality,
    })
}
