use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pool::{FrameBufferPool, FrameHandle};
use crate::stages::{Backend, PipelineFrame};
use crate::video::{FrameBuffer, FrameMeta, FrameShape, Rational};

pub mod adjust;
pub mod convert;
pub mod decimate;
pub mod deinterlace;
pub mod denoise;
pub mod overlay;
pub mod pad;
pub mod resize;
pub mod sharpen;
pub mod transform;

pub use adjust::{ColorspaceFilter, CurvesFilter, TweakFilter};
pub use convert::ConvertFilter;
pub use decimate::{DecimateFilter, MpDecimateFilter};
pub use deinterlace::{DeinterlaceFilter, DeinterlaceMode};
pub use denoise::{DenoiseFilter, DenoiseMode};
pub use overlay::{DelogoFilter, OverlayFilter, SubBurnFilter};
pub use pad::PadFilter;
pub use resize::{ResizeAlgorithm, ResizeEngine, ResizeFilter};
pub use sharpen::{SharpenFilter, SharpenMode};
pub use transform::TransformFilter;

use crate::job::VppParams;

/// Filter kinds in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Convert,
    Colorspace,
    Delogo,
    Afs,
    Nnedi,
    Yadif,
    Decimate,
    MpDecimate,
    Convolution3d,
    Smooth,
    Knn,
    Pmd,
    SubBurn,
    Resize,
    Unsharp,
    EdgeLevel,
    WarpSharp,
    Transform,
    Curves,
    Tweak,
    Deband,
    Pad,
    Overlay,
}

impl FilterKind {
    pub const ORDERED: [FilterKind; 23] = [
        FilterKind::Convert,
        FilterKind::Colorspace,
        FilterKind::Delogo,
        FilterKind::Afs,
        FilterKind::Nnedi,
        FilterKind::Yadif,
        FilterKind::Decimate,
        FilterKind::MpDecimate,
        FilterKind::Convolution3d,
        FilterKind::Smooth,
        FilterKind::Knn,
        FilterKind::Pmd,
        FilterKind::SubBurn,
        FilterKind::Resize,
        FilterKind::Unsharp,
        FilterKind::EdgeLevel,
        FilterKind::WarpSharp,
        FilterKind::Transform,
        FilterKind::Curves,
        FilterKind::Tweak,
        FilterKind::Deband,
        FilterKind::Pad,
        FilterKind::Overlay,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FilterKind::Convert => "convert",
            FilterKind::Colorspace => "colorspace",
            FilterKind::Delogo => "delogo",
            FilterKind::Afs => "afs",
            FilterKind::Nnedi => "nnedi",
            FilterKind::Yadif => "yadif",
            FilterKind::Decimate => "decimate",
            FilterKind::MpDecimate => "mpdecimate",
            FilterKind::Convolution3d => "convolution3d",
            FilterKind::Smooth => "smooth",
            FilterKind::Knn => "knn",
            FilterKind::Pmd => "pmd",
            FilterKind::SubBurn => "subburn",
            FilterKind::Resize => "resize",
            FilterKind::Unsharp => "unsharp",
            FilterKind::EdgeLevel => "edgelevel",
            FilterKind::WarpSharp => "warpsharp",
            FilterKind::Transform => "transform",
            FilterKind::Curves => "curves",
            FilterKind::Tweak => "tweak",
            FilterKind::Deband => "deband",
            FilterKind::Pad => "pad",
            FilterKind::Overlay => "overlay",
        }
    }

    pub fn is_deinterlacer(self) -> bool {
        matches!(self, FilterKind::Afs | FilterKind::Nnedi | FilterKind::Yadif)
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One picture transform inside a filter block.
///
/// `transform(None)` is the terminal call: the filter hands back whatever it still
/// retains. Filters that write into the caller's buffer report `overwrites_in_place`
/// and return the input handle; all others produce into `pool`.
pub trait Filter: Send {
    fn kind(&self) -> FilterKind;
    fn input_shape(&self) -> FrameShape;
    fn output_shape(&self) -> FrameShape;

    fn overwrites_in_place(&self) -> bool {
        false
    }

    /// Most frames a single call can emit.
    fn max_outputs(&self) -> usize {
        1
    }

    /// Frames kept alive between calls.
    fn retained_frames(&self) -> usize {
        0
    }

    fn transform(
        &mut self,
        input: Option<PipelineFrame>,
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>>;
}

/// What a filter constructor gets to see.
pub struct FilterContext<'a> {
    pub input: FrameShape,
    pub params: &'a VppParams,
    pub backend: Backend,
    /// Size the resize filter scales to.
    pub resize_to: (u32, u32),
    /// Timebase of the frame timestamps reaching the filter.
    pub timebase: Rational,
}

type FilterConstructor =
    Arc<dyn Fn(&FilterContext<'_>) -> Result<Box<dyn Filter>> + Send + Sync>;

pub struct FilterRegistry {
    factories: HashMap<FilterKind, FilterConstructor>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        register_defaults(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: FilterKind, constructor: F)
    where
        F: Fn(&FilterContext<'_>) -> Result<Box<dyn Filter>> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(constructor));
    }

    pub fn create(&self, kind: FilterKind, ctx: &FilterContext<'_>) -> Result<Box<dyn Filter>> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            PipelineError::UnsupportedOperation(format!(
                "no filter registered for '{kind}'. Available filters: {}",
                self.known_filters().join(", ")
            ))
        })?;
        factory(ctx)
    }

    pub fn known_filters(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds.into_iter().map(|kind| kind.to_string()).collect()
    }
}

fn missing(kind: FilterKind) -> PipelineError {
    PipelineError::Configuration(format!("filter '{kind}' requested without parameters"))
}

pub fn register_defaults(registry: &mut FilterRegistry) {
    registry.register(FilterKind::Colorspace, |ctx| {
        let params = ctx.params.colorspace.as_ref().ok_or_else(|| missing(FilterKind::Colorspace))?;
        Ok(Box::new(ColorspaceFilter::new(ctx.input, params)?))
    });
    registry.register(FilterKind::Delogo, |ctx| {
        let params = ctx.params.delogo.as_ref().ok_or_else(|| missing(FilterKind::Delogo))?;
        Ok(Box::new(DelogoFilter::new(ctx.input, params)?))
    });
    for kind in [FilterKind::Afs, FilterKind::Nnedi, FilterKind::Yadif] {
        registry.register(kind, move |ctx| {
            let mode = DeinterlaceMode::from_params(kind, ctx.params).ok_or_else(|| missing(kind))?;
            Ok(Box::new(DeinterlaceFilter::new(ctx.input, mode)?))
        });
    }
    registry.register(FilterKind::Decimate, |ctx| {
        let params = ctx.params.decimate.as_ref().ok_or_else(|| missing(FilterKind::Decimate))?;
        Ok(Box::new(DecimateFilter::new(ctx.input, params)?))
    });
    registry.register(FilterKind::MpDecimate, |ctx| {
        let params = ctx.params.mpdecimate.as_ref().ok_or_else(|| missing(FilterKind::MpDecimate))?;
        Ok(Box::new(MpDecimateFilter::new(ctx.input, params)))
    });
    for kind in [
        FilterKind::Convolution3d,
        FilterKind::Smooth,
        FilterKind::Knn,
        FilterKind::Pmd,
        FilterKind::Deband,
    ] {
        registry.register(kind, move |ctx| {
            let mode = DenoiseMode::from_params(kind, ctx.params).ok_or_else(|| missing(kind))?;
            Ok(Box::new(DenoiseFilter::new(ctx.input, mode)))
        });
    }
    registry.register(FilterKind::SubBurn, |ctx| {
        let params = ctx.params.subburn.as_ref().ok_or_else(|| missing(FilterKind::SubBurn))?;
        Ok(Box::new(SubBurnFilter::new(ctx.input, params, ctx.timebase)?))
    });
    registry.register(FilterKind::Resize, |ctx| {
        let (width, height) = ctx.resize_to;
        Ok(Box::new(ResizeFilter::new(
            ctx.input,
            width,
            height,
            ctx.params.resize.algorithm,
            ctx.backend,
        )?))
    });
    for kind in [FilterKind::Unsharp, FilterKind::EdgeLevel, FilterKind::WarpSharp] {
        registry.register(kind, move |ctx| {
            let mode = SharpenMode::from_params(kind, ctx.params).ok_or_else(|| missing(kind))?;
            Ok(Box::new(SharpenFilter::new(ctx.input, mode)))
        });
    }
    registry.register(FilterKind::Transform, |ctx| {
        let params = ctx.params.transform.as_ref().ok_or_else(|| missing(FilterKind::Transform))?;
        Ok(Box::new(TransformFilter::new(ctx.input, params)?))
    });
    registry.register(FilterKind::Curves, |ctx| {
        let params = ctx.params.curves.as_ref().ok_or_else(|| missing(FilterKind::Curves))?;
        Ok(Box::new(CurvesFilter::new(ctx.input, params)?))
    });
    registry.register(FilterKind::Tweak, |ctx| {
        let params = ctx.params.tweak.as_ref().ok_or_else(|| missing(FilterKind::Tweak))?;
        Ok(Box::new(TweakFilter::new(ctx.input, params)))
    });
    registry.register(FilterKind::Pad, |ctx| {
        let params = ctx.params.pad.as_ref().ok_or_else(|| missing(FilterKind::Pad))?;
        Ok(Box::new(PadFilter::new(ctx.input, params)?))
    });
    registry.register(FilterKind::Overlay, |ctx| {
        let params = ctx.params.overlay.as_ref().ok_or_else(|| missing(FilterKind::Overlay))?;
        Ok(Box::new(OverlayFilter::new(ctx.input, params)?))
    });
}

/// Checks out a buffer from `pool` and shapes it for `shape`.
pub(crate) fn new_frame(
    pool: &FrameBufferPool,
    shape: FrameShape,
    filter: FilterKind,
) -> Result<FrameHandle> {
    let handle = pool.checkout().ok_or_else(|| {
        PipelineError::stage(filter.name(), format!("pool '{}' is exhausted", pool.label()))
    })?;
    handle.lock().reshape(shape)?;
    Ok(handle)
}

/// Makes sure `frame` is the only reference to its buffer before it is modified.
pub(crate) fn writable(
    frame: PipelineFrame,
    pool: &FrameBufferPool,
    filter: FilterKind,
) -> Result<PipelineFrame> {
    if frame.handle.ref_count() <= 1 {
        return Ok(frame);
    }
    let shape = frame.handle.shape();
    let handle = new_frame(pool, shape, filter)?;
    handle.lock().copy_from(&frame.handle.lock())?;
    Ok(PipelineFrame::new(handle, frame.meta))
}

/// Runs `kernel` from `frame` into a fresh buffer of `shape`.
pub(crate) fn map_frame<F>(
    frame: PipelineFrame,
    pool: &FrameBufferPool,
    shape: FrameShape,
    filter: FilterKind,
    kernel: F,
) -> Result<PipelineFrame>
where
    F: FnOnce(&FrameBuffer, &mut FrameBuffer),
{
    let handle = new_frame(pool, shape, filter)?;
    {
        let src = frame.handle.lock();
        let mut dst = handle.lock();
        kernel(&src, &mut dst);
    }
    let mut meta: FrameMeta = frame.meta;
    meta.pic_struct = shape.pic_struct;
    Ok(PipelineFrame::new(handle, meta))
}

// Channel 0 is luma, 1 and 2 are the chroma components on the chroma grid.

#[inline]
pub(crate) fn channel_size(buf: &FrameBuffer, channel: usize) -> (usize, usize) {
    if channel == 0 {
        buf.luma_size()
    } else {
        buf.chroma_size()
    }
}

#[inline]
pub(crate) fn get(buf: &FrameBuffer, channel: usize, x: usize, y: usize) -> u16 {
    if channel == 0 {
        buf.sample(0, x, y)
    } else {
        buf.chroma(channel - 1, x, y)
    }
}

#[inline]
pub(crate) fn put(buf: &mut FrameBuffer, channel: usize, x: usize, y: usize, value: u16) {
    if channel == 0 {
        buf.set_sample(0, x, y, value);
    } else {
        buf.set_chroma(channel - 1, x, y, value);
    }
}

/// Sample at (`x`, `y`) with coordinates clamped to the channel edges.
#[inline]
pub(crate) fn get_clamped(buf: &FrameBuffer, channel: usize, x: isize, y: isize) -> u16 {
    let (w, h) = channel_size(buf, channel);
    let x = x.clamp(0, w as isize - 1) as usize;
    let y = y.clamp(0, h as isize - 1) as usize;
    get(buf, channel, x, y)
}

#[inline]
pub(crate) fn clamp_sample(value: f32, max: u16) -> u16 {
    value.round().clamp(0.0, max as f32) as u16
}

pub(crate) fn copy_channel(src: &FrameBuffer, dst: &mut FrameBuffer, channel: usize) {
    let (w, h) = channel_size(src, channel);
    for y in 0..h {
        for x in 0..w {
            put(dst, channel, x, y, get(src, channel, x, y));
        }
    }
}

/// Black level (`y`, `u`, `v`) for a limited-range picture of `bit_depth`.
pub(crate) fn black_level(bit_depth: u8) -> (u16, u16, u16) {
    let shift = bit_depth.saturating_sub(8);
    (16 << shift, 128 << shift, 128 << shift)
}

/// Integer pixel rectangle used by region filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn check_inside(&self, shape: &FrameShape, filter: FilterKind) -> Result<()> {
        if self.width == 0
            || self.height == 0
            || self.x + self.width > shape.width
            || self.y + self.height > shape.height
        {
            return Err(PipelineError::InvalidParameter(format!(
                "{filter}: region {}x{}+{}+{} does not fit a {}x{} frame",
                self.width, self.height, self.x, self.y, shape.width, shape.height
            )));
        }
        Ok(())
    }

    /// The rectangle on `channel`'s sample grid.
    pub(crate) fn on_channel(&self, shape: &FrameShape, channel: usize) -> (usize, usize, usize, usize) {
        if channel == 0 {
            return (
                self.x as usize,
                self.y as usize,
                self.width as usize,
                self.height as usize,
            );
        }
        let (cw, _) = shape.chroma_size();
        let sx = if cw == shape.width as usize { 1 } else { 2 };
        let sy = if shape.chroma_size().1 == shape.height as usize { 1 } else { 2 };
        (
            self.x as usize / sx,
            self.y as usize / sy,
            (self.width as usize).div_ceil(sx),
            (self.height as usize).div_ceil(sy),
        )
    }
}
