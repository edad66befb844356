use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::allocation::{AllocationPlanner, PoolPlan};
use crate::error::{PipelineError, Result};
use crate::filters::{
    ConvertFilter, Filter, FilterContext, FilterKind, FilterRegistry, ResizeEngine,
};
use crate::hw::{CodecConfig, HwDevice, PrepConfig, RateControlConfig};
use crate::job::{InputContainer, TranscodeJob, VppParams};
use crate::observability::MetricsCollector;
use crate::quality::{QualityMetric, QualitySummary, SharedMetric, check_gates};
use crate::scheduler::{CancelToken, RunSummary, Scheduler};
use crate::sink::{AuxSink, FileAuxSink, FileSink, OutputSink};
use crate::source::{
    ElementaryStreamSource, InputInfo, RawFileSource, SharedSource, shared,
};
use crate::stages::{
    AudioStage, Backend, DecodeStage, EncodeStage, FilterBlockStage, InputStage, MetricStage,
    PipelineStage, StageDescriptor, TimestampStage, TrimStage,
};
use crate::validation::{VideoParams, check_processing, check_video_params};
use crate::video::{ChromaLayout, Crop, FrameShape, PixelFormat, Rational, VideoCodec};

/// How the filter chain crosses from one backend to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Join {
    /// Same block, no sync point.
    Fuse,
    /// New block, frames handed over unchanged.
    Direct,
    Split,
    /// The left block ends with a conversion back to a codec layout.
    ConvertExit,
    ConvertExitSplit,
    /// The right block starts with a conversion into a compute layout.
    ConvertEntry,
    SplitConvertEntry,
}

impl Join {
    fn converts_on_exit(self) -> bool {
        matches!(self, Join::ConvertExit | Join::ConvertExitSplit)
    }

    fn converts_on_entry(self) -> bool {
        matches!(self, Join::ConvertEntry | Join::SplitConvertEntry)
    }

    fn starts_block(self) -> bool {
        self != Join::Fuse
    }
}

/// Adjacency table for neighbouring filter backends. Pairings not listed are rejected.
pub fn adjacency(left: Backend, right: Backend) -> Result<Join> {
    use Backend::*;
    let join = match (left, right) {
        (Compute, Compute) => Join::Fuse,
        (Compute, FixedFunction) => Join::ConvertExitSplit,
        (Compute, Codec | Host) => Join::ConvertExit,
        (FixedFunction, Compute) => Join::SplitConvertEntry,
        (FixedFunction, FixedFunction) => Join::Split,
        (FixedFunction, Codec | Host) => Join::Direct,
        (Codec | Host, Compute) => Join::ConvertEntry,
        (Codec | Host, FixedFunction) => Join::Direct,
        (left, right) => {
            return Err(PipelineError::Configuration(format!(
                "no filter join is defined from the {left} backend to the {right} backend"
            )));
        }
    };
    Ok(join)
}

/// Codec layout a compute-format frame returns to.
fn native_format(format: PixelFormat) -> PixelFormat {
    match format {
        PixelFormat::Yuv420 => PixelFormat::Nv12,
        PixelFormat::Yuv420P16 => PixelFormat::P010,
        other => other,
    }
}

/// Encoder configuration groups as applied to the device.
#[derive(Debug, Clone, Serialize)]
pub struct EncoderConfig {
    pub codec: VideoCodec,
    pub prep: PrepConfig,
    pub rate_control: RateControlConfig,
    pub codec_options: CodecConfig,
}

/// Filters of one future filter-block stage.
struct BlockPlan {
    backend: Backend,
    filters: Vec<Box<dyn Filter>>,
}

/// Walks the filter list, tracking the frame shape between filters.
struct ChainBuilder<'a> {
    registry: &'a FilterRegistry,
    vpp: &'a VppParams,
    resize_to: (u32, u32),
    timebase: Rational,
    shape: FrameShape,
    crop: Crop,
    blocks: Vec<BlockPlan>,
}

impl ChainBuilder<'_> {
    fn open_block(&mut self, backend: Backend) {
        self.blocks.push(BlockPlan {
            backend,
            filters: Vec::new(),
        });
    }

    fn push(&mut self, filter: Box<dyn Filter>) -> Result<()> {
        let block = self.blocks.last_mut().ok_or_else(|| {
            PipelineError::InvalidOperation(format!("filter '{}' has no block", filter.kind()))
        })?;
        self.shape = filter.output_shape();
        block.filters.push(filter);
        Ok(())
    }

    fn push_filter(&mut self, kind: FilterKind, backend: Backend) -> Result<()> {
        let ctx = FilterContext {
            input: self.shape,
            params: self.vpp,
            backend,
            resize_to: self.resize_to,
            timebase: self.timebase,
        };
        let filter = self.registry.create(kind, &ctx)?;
        self.push(filter)
    }

    /// Converts to `format`/`bit_depth`, applying any crop still pending.
    fn push_convert(&mut self, format: PixelFormat, bit_depth: u8) -> Result<()> {
        let crop = std::mem::take(&mut self.crop);
        let filter = ConvertFilter::new(self.shape, format, bit_depth, crop)?;
        self.push(Box::new(filter))
    }

    fn converts_to(&self, format: PixelFormat, bit_depth: u8) -> bool {
        self.shape.format != format || self.shape.bit_depth != bit_depth || !self.crop.is_empty()
    }
}

/// A built, allocated stage chain ready to run.
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
    pools: Vec<PoolPlan>,
    params: VideoParams,
    info: InputInfo,
    output_shape: FrameShape,
    encoder: Option<EncoderConfig>,
    metric: Option<SharedMetric>,
}

impl Pipeline {
    pub fn stages(&self) -> &[Box<dyn PipelineStage>] {
        &self.stages
    }

    pub fn descriptors(&self) -> Vec<StageDescriptor> {
        self.stages
            .iter()
            .enumerate()
            .map(|(index, stage)| stage.describe(index))
            .collect()
    }

    pub fn pools(&self) -> &[PoolPlan] {
        &self.pools
    }

    pub fn params(&self) -> &VideoParams {
        &self.params
    }

    pub fn input_info(&self) -> &InputInfo {
        &self.info
    }

    /// Shape of the frames the encoder or the raw sink receives.
    pub fn output_shape(&self) -> FrameShape {
        self.output_shape
    }

    pub fn encoder_config(&self) -> Option<&EncoderConfig> {
        self.encoder.as_ref()
    }

    pub fn quality_summary(&self) -> Option<QualitySummary> {
        self.metric.as_ref().map(|metric| metric.lock().summary())
    }

    pub fn run(&mut self, scheduler: &mut Scheduler, sink: &mut dyn OutputSink) -> Result<RunSummary> {
        scheduler.run(&mut self.stages, sink)
    }
}

/// Turns a job and an opened source into a stage chain.
pub struct PipelineBuilder<'a> {
    device: &'a dyn HwDevice,
    registry: &'a FilterRegistry,
    aux_sinks: HashMap<usize, Box<dyn AuxSink>>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(device: &'a dyn HwDevice, registry: &'a FilterRegistry) -> Self {
        Self {
            device,
            registry,
            aux_sinks: HashMap::new(),
        }
    }

    pub fn with_aux_sink(mut self, stream: usize, sink: Box<dyn AuxSink>) -> Self {
        self.aux_sinks.insert(stream, sink);
        self
    }

    #[instrument(skip_all, fields(device = self.device.name()))]
    pub fn build(self, job: &TranscodeJob, source: SharedSource) -> Result<Pipeline> {
        check_processing(&job.filters)?;
        let info = source.lock().info().clone();
        let params = check_video_params(job, &info)?;
        let compute = job.control.compute.resolve(self.device.compute_available())?;
        let scaler = self.device.fixed_function_scaler();
        if let Some(codec) = params.codec()
            && !self.device.supports_encode(codec)
        {
            return Err(PipelineError::UnsupportedCodec {
                codec,
                component: "encoder",
            });
        }
        debug!(compute, scaler, fps = %params.fps, source = %params.source, "Building pipeline");

        let mut stages: Vec<Box<dyn PipelineStage>> = Vec::new();
        if let Some(trim) = params.trim.clone() {
            source.lock().set_trim(trim);
        }
        match info.codec {
            Some(codec) => {
                let decoder = self.device.open_decoder(codec, &info)?;
                stages.push(Box::new(DecodeStage::new(source.clone(), decoder)));
            }
            None => stages.push(Box::new(InputStage::new(source.clone()))),
        }
        let input_backend = stages[0].backend();
        let source_shape = stages[0]
            .required_output()
            .map_or(params.source, |request| request.shape);

        if !self.aux_sinks.is_empty() {
            stages.push(Box::new(AudioStage::new(source.clone(), self.aux_sinks)));
        }
        if let Some(trim) = params.trim.clone().filter(|trim| !trim.is_empty()) {
            stages.push(Box::new(TrimStage::new(trim)));
        }
        let output_tb = job.sync.timebase.unwrap_or(params.fps.inv());
        let source_tb = info.timebase.unwrap_or(params.fps.inv());
        stages.push(Box::new(TimestampStage::new(
            job.sync.mode,
            params.fps,
            source_tb,
            output_tb,
            params.timestamp_quality,
        )?));

        let items = assign_backends(&job.filters, &params, compute, scaler)?;
        let tail = if params.encoder.is_some() {
            Backend::Codec
        } else {
            Backend::Host
        };
        let mut chain = ChainBuilder {
            registry: self.registry,
            vpp: &job.filters,
            resize_to: params.resize_to,
            timebase: output_tb,
            shape: source_shape,
            crop: params.crop,
            blocks: Vec::new(),
        };

        // A crop that cannot ride on a compute entry conversion gets its own block.
        let starts_on_compute = items.first().is_some_and(|(_, backend)| *backend == Backend::Compute);
        if !chain.crop.is_empty() && !starts_on_compute {
            let backend = convert_backend(compute, scaler, chain.shape)?;
            chain.open_block(backend);
            let (format, depth) = if items.is_empty() {
                (params.output_format, params.output_depth)
            } else {
                (chain.shape.format, chain.shape.bit_depth)
            };
            chain.push_convert(format, depth)?;
        }

        let mut prev = chain.blocks.last().map_or(input_backend, |block| block.backend);
        for &(kind, backend) in &items {
            let join = adjacency(prev, backend)?;
            if join.converts_on_exit() {
                let format = native_format(chain.shape.format);
                if chain.converts_to(format, chain.shape.bit_depth) {
                    chain.push_convert(format, chain.shape.bit_depth)?;
                }
            }
            if join.starts_block() {
                chain.open_block(backend);
            }
            if join.converts_on_entry() {
                let format = chain.shape.format.compute_format();
                if chain.converts_to(format, chain.shape.bit_depth) {
                    chain.push_convert(format, chain.shape.bit_depth)?;
                }
            }
            chain.push_filter(kind, backend)?;
            prev = backend;
        }
        if !chain.blocks.is_empty()
            && adjacency(prev, tail)?.converts_on_exit()
            && chain.converts_to(params.output_format, params.output_depth)
        {
            chain.push_convert(params.output_format, params.output_depth)?;
        }
        if chain.converts_to(params.output_format, params.output_depth) {
            let backend = convert_backend(compute, scaler, chain.shape)?;
            debug!(from = %chain.shape, to = %params.output_format, %backend, "Inserting output conversion");
            chain.open_block(backend);
            chain.push_convert(params.output_format, params.output_depth)?;
        }

        let output_shape = chain.shape;
        let mut blocks = chain.blocks;

        let metric = match (job.metric.enabled, &params.encoder) {
            (false, _) => None,
            (true, None) => {
                return Err(PipelineError::Configuration(
                    "the quality metric compares encoded output and needs an encoder".into(),
                ));
            }
            (true, Some(encoder)) => {
                let codec = encoder.codec.unwrap_or_default();
                let mut decoded = InputInfo::raw(output_shape, params.fps);
                decoded.codec = Some(codec);
                decoded.timebase = Some(output_tb);
                let decoder = self.device.open_decoder(codec, &decoded)?;
                Some(QualityMetric::new(decoder)?.shared())
            }
        };

        // The metric rides on a trailing compute block, taps a trailing fixed-function
        // block, or gets a copy block of its own next to the input.
        let mut fuse_metric = false;
        let mut tap_metric = false;
        if metric.is_some() {
            match blocks.last() {
                Some(block) if block.backend == Backend::Compute => fuse_metric = true,
                Some(_) => tap_metric = true,
                None => {
                    let backend = convert_backend(compute, scaler, output_shape)?;
                    let copy = ConvertFilter::new(
                        output_shape,
                        output_shape.format,
                        output_shape.bit_depth,
                        Crop::default(),
                    )?;
                    blocks.push(BlockPlan {
                        backend,
                        filters: vec![Box::new(copy)],
                    });
                    fuse_metric = true;
                }
            }
        }

        let block_count = blocks.len();
        for (index, block) in blocks.into_iter().enumerate() {
            let name = format!("vpp{index}-{}", block.backend);
            let mut stage = FilterBlockStage::new(name, block.backend, block.filters)?;
            if fuse_metric
                && index + 1 == block_count
                && let Some(metric) = &metric
            {
                stage = stage.with_metric(metric.clone());
            }
            stages.push(Box::new(stage));
        }
        if tap_metric && let Some(metric) = &metric {
            stages.push(Box::new(MetricStage::new(metric.clone())));
        }

        let encoder = match &params.encoder {
            Some(encoder_params) => {
                let codec = encoder_params.codec.unwrap_or_default();
                let prep = PrepConfig::new(output_shape, encoder_params.rotation, output_tb)?;
                let rate_control = RateControlConfig::from_params(encoder_params, params.fps);
                let codec_options = CodecConfig::from_params(codec, encoder_params, params.output_depth)?;
                let device_encoder = self.device.open_encoder(codec)?;
                let mut stage = EncodeStage::new(device_encoder, &prep, &rate_control, &codec_options)?;
                if let Some(metric) = &metric {
                    stage = stage.with_metric(metric.clone());
                }
                stages.push(Box::new(stage));
                Some(EncoderConfig {
                    codec,
                    prep,
                    rate_control,
                    codec_options,
                })
            }
            None => None,
        };

        if stages.is_empty() {
            return Err(PipelineError::InvalidOperation(
                "pipeline has no stages".into(),
            ));
        }
        let pools = AllocationPlanner::new(job.control.async_depth).allocate(&mut stages)?;

        info!(
            stages = stages.len(),
            pools = pools.len(),
            output = %output_shape,
            codec = ?encoder.as_ref().map(|config| config.codec),
            "Pipeline built"
        );
        for (index, stage) in stages.iter().enumerate() {
            debug!(index, stage = stage.name(), backend = %stage.backend(), filters = ?stage.filter_names(), "Stage");
        }

        Ok(Pipeline {
            stages,
            pools,
            params,
            info,
            output_shape,
            encoder,
            metric,
        })
    }
}

/// Backend each enabled filter runs on, in application order.
fn assign_backends(
    vpp: &VppParams,
    params: &VideoParams,
    compute: bool,
    scaler: bool,
) -> Result<Vec<(FilterKind, Backend)>> {
    let resize = params.resize_to != params.cropped;
    let mut items = Vec::new();
    let mut auto_resize = None;
    for kind in FilterKind::ORDERED {
        if kind == FilterKind::Resize {
            if !resize {
                continue;
            }
            let backend = resize_backend(vpp.resize.engine, params.source.format, compute, scaler)?;
            if vpp.resize.engine == ResizeEngine::Auto && backend == Backend::FixedFunction {
                auto_resize = Some(items.len());
            }
            items.push((kind, backend));
        } else if vpp.is_enabled(kind) {
            if !compute {
                return Err(PipelineError::UnsupportedOperation(format!(
                    "filter '{kind}' needs the compute backend, which is not available"
                )));
            }
            items.push((kind, Backend::Compute));
        }
    }

    if let Some(index) = auto_resize
        && compute
        && index > 0
        && items.get(index - 1).is_some_and(|(_, backend)| *backend == Backend::Compute)
        && items.get(index + 1).is_some_and(|(_, backend)| *backend == Backend::Compute)
    {
        debug!("Resize between compute filters promoted to the compute backend");
        items[index].1 = Backend::Compute;
    }
    Ok(items)
}

fn resize_backend(
    engine: ResizeEngine,
    format: PixelFormat,
    compute: bool,
    scaler: bool,
) -> Result<Backend> {
    let scaler_reads = scaler && format.chroma() != ChromaLayout::Planar444;
    match engine {
        ResizeEngine::Compute if compute => Ok(Backend::Compute),
        ResizeEngine::Compute if scaler_reads => {
            warn!("Compute backend unavailable, resizing on the fixed-function scaler");
            Ok(Backend::FixedFunction)
        }
        ResizeEngine::FixedFunction if scaler => Ok(Backend::FixedFunction),
        ResizeEngine::Auto if scaler_reads => Ok(Backend::FixedFunction),
        ResizeEngine::Auto if compute => Ok(Backend::Compute),
        ResizeEngine::FixedFunction => Err(PipelineError::UnsupportedOperation(
            "device has no fixed-function scaler".into(),
        )),
        _ => Err(PipelineError::UnsupportedOperation(format!(
            "no backend can resize {format} frames on this device"
        ))),
    }
}

/// Backend for a standalone conversion block.
fn convert_backend(compute: bool, scaler: bool, shape: FrameShape) -> Result<Backend> {
    if compute {
        Ok(Backend::Compute)
    } else if scaler && !shape.format.is_compute_native() {
        Ok(Backend::FixedFunction)
    } else {
        Err(PipelineError::UnsupportedOperation(format!(
            "converting {shape} needs the compute backend, which is not available"
        )))
    }
}

/// Builds the pipeline for `source` with the default filter set.
pub fn build_pipeline(
    job: &TranscodeJob,
    source: SharedSource,
    device: &dyn HwDevice,
) -> Result<Pipeline> {
    let registry = FilterRegistry::with_defaults();
    PipelineBuilder::new(device, &registry).build(job, source)
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscodeResult {
    pub input: PathBuf,
    pub output: PathBuf,
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualitySummary>,
}

/// Runs a job over every input it matches.
pub struct PipelineExecutor {
    job: TranscodeJob,
    device: Arc<dyn HwDevice>,
    registry: FilterRegistry,
    metrics: MetricsCollector,
    cancel: CancelToken,
}

impl PipelineExecutor {
    pub fn new(job: TranscodeJob, device: Arc<dyn HwDevice>) -> Self {
        Self {
            job,
            device,
            registry: FilterRegistry::with_defaults(),
            metrics: MetricsCollector::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn job(&self) -> &TranscodeJob {
        &self.job
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn open_source(&self, input: &Path) -> anyhow::Result<SharedSource> {
        let params = &self.job.input;
        let source = match params.container.resolve(input) {
            InputContainer::Rfv => shared(
                ElementaryStreamSource::open(input)
                    .with_context(|| format!("Failed to open stream: {}", input.display()))?,
            ),
            InputContainer::Raw | InputContainer::Auto => {
                if params.width == 0 || params.height == 0 {
                    bail!(
                        "Raw input {} needs input.width and input.height in the job file",
                        input.display()
                    );
                }
                shared(
                    RawFileSource::open(input, params.stored_shape(), params.fps, params.crop)
                        .with_context(|| format!("Failed to open raw input: {}", input.display()))?,
                )
            }
        };
        Ok(source)
    }

    /// Builds and allocates the pipeline for `input` without running it.
    pub fn build(&self, input: &Path) -> anyhow::Result<Pipeline> {
        self.build_with(input, false)
    }

    fn build_with(&self, input: &Path, aux_outputs: bool) -> anyhow::Result<Pipeline> {
        let source = self.open_source(input)?;
        let mut builder = PipelineBuilder::new(self.device.as_ref(), &self.registry);
        if aux_outputs {
            for (stream, path) in self.job.aux_paths(input) {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create output directory: {}", parent.display())
                    })?;
                }
                builder = builder.with_aux_sink(stream, Box::new(FileAuxSink::create(&path)?));
            }
        }
        let pipeline = builder
            .build(&self.job, source)
            .with_context(|| format!("Failed to build pipeline for {}", input.display()))?;
        Ok(pipeline)
    }

    pub fn execute(&self) -> anyhow::Result<Vec<TranscodeResult>> {
        self.metrics.reset();
        let inputs = self.job.expand_inputs()?;
        let mut results = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let result = self.process(input);
            self.metrics.record_job(result.is_ok());
            results.push(result?);
        }
        Ok(results)
    }

    #[instrument(skip(self), fields(input = %input.display()))]
    pub fn process(&self, input: &Path) -> anyhow::Result<TranscodeResult> {
        let mut pipeline = self.build_with(input, true)?;
        let output = self.job.output_path(input);
        let mut sink = FileSink::create(&output)?;
        let mut scheduler = Scheduler::new(self.cancel.clone())
            .with_speed_limit(self.job.control.max_fps)
            .with_metrics(self.metrics.clone());
        let summary = pipeline
            .run(&mut scheduler, &mut sink)
            .with_context(|| format!("Transcode failed: {}", input.display()))?;

        let quality = pipeline.quality_summary();
        if let Some(quality) = &quality {
            info!(
                frames = quality.frames,
                mean_ssim = quality.mean_ssim,
                min_ssim = quality.min_ssim,
                mean_psnr = quality.mean_psnr,
                "Quality summary"
            );
        }
        check_gates(
            &quality.clone().unwrap_or_default(),
            &self.job.quality_gates,
            &self.metrics,
        )?;

        Ok(TranscodeResult {
            input: input.to_path_buf(),
            output,
            summary,
            quality,
        })
    }
}
