//! Per-sample colour adjustments.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::{FrameBuffer, FrameShape};

use super::{Filter, FilterKind, channel_size, clamp_sample, get, map_frame, put, writable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMatrix {
    Bt601,
    Bt709,
}

impl ColorMatrix {
    /// Luma coefficients (kr, kb).
    fn coefficients(self) -> (f32, f32) {
        match self {
            ColorMatrix::Bt601 => (0.299, 0.114),
            ColorMatrix::Bt709 => (0.2126, 0.0722),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorspaceParams {
    pub from: ColorMatrix,
    pub to: ColorMatrix,
}

impl Default for ColorspaceParams {
    fn default() -> Self {
        Self {
            from: ColorMatrix::Bt601,
            to: ColorMatrix::Bt709,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TweakParams {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub gamma: f32,
    /// Hue rotation in degrees.
    pub hue: f32,
}

impl Default for TweakParams {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
            gamma: 1.0,
            hue: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurvesParams {
    /// Control points `[input, output]` on a 0..1 scale, applied to luma.
    pub points: Vec<[f32; 2]>,
}

impl Default for CurvesParams {
    fn default() -> Self {
        Self {
            points: vec![[0.0, 0.0], [1.0, 1.0]],
        }
    }
}

/// Limited-range normalisation for one sample depth.
#[derive(Clone, Copy)]
struct Levels {
    black: f32,
    luma_range: f32,
    mid: f32,
    chroma_range: f32,
}

impl Levels {
    fn new(bit_depth: u8) -> Self {
        let scale = (1u32 << bit_depth.saturating_sub(8)) as f32;
        Self {
            black: 16.0 * scale,
            luma_range: 219.0 * scale,
            mid: 128.0 * scale,
            chroma_range: 224.0 * scale,
        }
    }
}

fn to_rgb(y: f32, cb: f32, cr: f32, (kr, kb): (f32, f32)) -> (f32, f32, f32) {
    let r = y + 2.0 * (1.0 - kr) * cr;
    let b = y + 2.0 * (1.0 - kb) * cb;
    let g = (y - kr * r - kb * b) / (1.0 - kr - kb);
    (r, g, b)
}

fn from_rgb((r, g, b): (f32, f32, f32), (kr, kb): (f32, f32)) -> (f32, f32, f32) {
    let y = kr * r + (1.0 - kr - kb) * g + kb * b;
    (y, (b - y) / (2.0 * (1.0 - kb)), (r - y) / (2.0 * (1.0 - kr)))
}

/// Re-encodes YUV from one matrix to another.
pub struct ColorspaceFilter {
    shape: FrameShape,
    params: ColorspaceParams,
}

impl ColorspaceFilter {
    pub fn new(input: FrameShape, params: &ColorspaceParams) -> Result<Self> {
        if params.from == params.to {
            return Err(PipelineError::InvalidParameter(format!(
                "colorspace conversion from {:?} to itself",
                params.from
            )));
        }
        Ok(Self {
            shape: input,
            params: *params,
        })
    }
}

impl Filter for ColorspaceFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Colorspace
    }

    fn input_shape(&self) -> FrameShape {
        self.shape
    }

    fn output_shape(&self) -> FrameShape {
        self.shape
    }

    fn transform(
        &mut self,
        input: Option<PipelineFrame>,
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let shape = frame.handle.shape();
        let (from, to) = (self.params.from.coefficients(), self.params.to.coefficients());
        let out = map_frame(frame, pool, shape, FilterKind::Colorspace, |src, dst| {
            convert_matrix(src, dst, from, to);
        })?;
        Ok(vec![out])
    }
}

fn convert_matrix(src: &FrameBuffer, dst: &mut FrameBuffer, from: (f32, f32), to: (f32, f32)) {
    let levels = Levels::new(src.shape().bit_depth);
    let max = dst.max_value();
    let (w, h) = src.luma_size();
    let (cw, ch) = src.chroma_size();
    let (sx, sy) = (w.div_ceil(cw).max(1), h.div_ceil(ch).max(1));
    let read = |x: usize, y: usize, cx: usize, cy: usize| {
        let luma = (src.sample(0, x, y) as f32 - levels.black) / levels.luma_range;
        let cb = (src.chroma(0, cx, cy) as f32 - levels.mid) / levels.chroma_range;
        let cr = (src.chroma(1, cx, cy) as f32 - levels.mid) / levels.chroma_range;
        from_rgb(to_rgb(luma, cb, cr, from), to)
    };
    for y in 0..h {
        for x in 0..w {
            let (luma, _, _) = read(x, y, (x / sx).min(cw - 1), (y / sy).min(ch - 1));
            dst.set_sample(0, x, y, clamp_sample(luma * levels.luma_range + levels.black, max));
        }
    }
    for cy in 0..ch {
        for cx in 0..cw {
            let (_, cb, cr) = read((cx * sx).min(w - 1), (cy * sy).min(h - 1), cx, cy);
            dst.set_chroma(0, cx, cy, clamp_sample(cb * levels.chroma_range + levels.mid, max));
            dst.set_chroma(1, cx, cy, clamp_sample(cr * levels.chroma_range + levels.mid, max));
        }
    }
}

/// Brightness, contrast, gamma, saturation and hue, applied in place.
pub struct TweakFilter {
    shape: FrameShape,
    params: TweakParams,
}

impl TweakFilter {
    pub fn new(input: FrameShape, params: &TweakParams) -> Self {
        Self {
            shape: input,
            params: *params,
        }
    }

    fn apply(&self, buf: &mut FrameBuffer) {
        let p = &self.params;
        let levels = Levels::new(buf.shape().bit_depth);
        let max = buf.max_value();
        let (w, h) = buf.luma_size();
        let inv_gamma = 1.0 / p.gamma.max(0.01);
        for y in 0..h {
            for x in 0..w {
                let mut v = (buf.sample(0, x, y) as f32 - levels.black) / levels.luma_range;
                v = (v - 0.5) * p.contrast + 0.5 + p.brightness;
                v = v.clamp(0.0, 1.0).powf(inv_gamma);
                buf.set_sample(0, x, y, clamp_sample(v * levels.luma_range + levels.black, max));
            }
        }
        let (sin, cos) = p.hue.to_radians().sin_cos();
        let (cw, ch) = buf.chroma_size();
        for cy in 0..ch {
            for cx in 0..cw {
                let u = buf.chroma(0, cx, cy) as f32 - levels.mid;
                let v = buf.chroma(1, cx, cy) as f32 - levels.mid;
                let nu = (u * cos - v * sin) * p.saturation;
                let nv = (u * sin + v * cos) * p.saturation;
                buf.set_chroma(0, cx, cy, clamp_sample(nu + levels.mid, max));
                buf.set_chroma(1, cx, cy, clamp_sample(nv + levels.mid, max));
            }
        }
    }
}

impl Filter for TweakFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Tweak
    }

    fn input_shape(&self) -> FrameShape {
        self.shape
    }

    fn output_shape(&self) -> FrameShape {
        self.shape
    }

    fn overwrites_in_place(&self) -> bool {
        true
    }

    fn transform(
        &mut self,
        input: Option<PipelineFrame>,
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let frame = writable(frame, pool, FilterKind::Tweak)?;
        self.apply(&mut frame.handle.lock());
        Ok(vec![frame])
    }
}

/// Luma tone curve through a lookup table built from control points.
pub struct CurvesFilter {
    shape: FrameShape,
    lut: Vec<u16>,
}

impl CurvesFilter {
    pub fn new(input: FrameShape, params: &CurvesParams) -> Result<Self> {
        let points = &params.points;
        if points.len() < 2 {
            return Err(PipelineError::InvalidParameter(
                "curves needs at least two control points".into(),
            ));
        }
        let in_range = |v: f32| (0.0..=1.0).contains(&v);
        if points.iter().any(|[x, y]| !in_range(*x) || !in_range(*y))
            || points.windows(2).any(|pair| pair[1][0] <= pair[0][0])
        {
            return Err(PipelineError::InvalidParameter(
                "curves control points must lie in 0..1 with increasing inputs".into(),
            ));
        }
        let max = input.max_sample();
        let lut = (0..=max as u32)
            .map(|sample| {
                let x = sample as f32 / max as f32;
                clamp_sample(interpolate(points, x) * max as f32, max)
            })
            .collect();
        Ok(Self { shape: input, lut })
    }

    pub fn map(&self, sample: u16) -> u16 {
        self.lut[(sample as usize).min(self.lut.len() - 1)]
    }
}

fn interpolate(points: &[[f32; 2]], x: f32) -> f32 {
    let first = points[0];
    let last = points[points.len() - 1];
    if x <= first[0] {
        return first[1];
    }
    if x >= last[0] {
        return last[1];
    }
    for pair in points.windows(2) {
        let ([x0, y0], [x1, y1]) = (pair[0], pair[1]);
        if x <= x1 {
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    last[1]
}

impl Filter for CurvesFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Curves
    }

    fn input_shape(&self) -> FrameShape {
        self.shape
    }

    fn output_shape(&self) -> FrameShape {
        self.shape
    }

    fn overwrites_in_place(&self) -> bool {
        true
    }

    fn transform(
        &mut self,
        input: Option<PipelineFrame>,
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let frame = writable(frame, pool, FilterKind::Curves)?;
        {
            let mut buf = frame.handle.lock();
            let (w, h) = channel_size(&buf, 0);
            for y in 0..h {
                for x in 0..w {
                    let v = get(&buf, 0, x, y);
                    put(&mut buf, 0, x, y, self.map(v));
                }
            }
        }
        Ok(vec![frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FrameMeta, MemoryDomain, PixelFormat};

    fn gray_frame(pool: &FrameBufferPool, y: u16, u: u16, v: u16) -> PipelineFrame {
        let handle = pool.checkout().unwrap();
        handle.lock().fill(y, u, v);
        PipelineFrame::new(handle, FrameMeta::default())
    }

    #[test]
    fn tweak_is_identity_by_default_and_edits_in_place() {
        let shape = FrameShape::new(8, 8, PixelFormat::Nv12);
        let mut pool = FrameBufferPool::new("frames");
        pool.allocate(2, shape, MemoryDomain::Codec).unwrap();
        let frame = gray_frame(&pool, 120, 100, 160);
        let slot = frame.handle.slot_index();
        let mut filter = TweakFilter::new(shape, &TweakParams::default());
        let out = filter.transform(Some(frame), &pool).unwrap();
        assert_eq!(out[0].handle.slot_index(), slot);
        let buf = out[0].handle.lock();
        assert_eq!(buf.sample(0, 3, 3), 120);
        assert_eq!((buf.chroma(0, 1, 1), buf.chroma(1, 1, 1)), (100, 160));
    }

    #[test]
    fn tweak_copies_shared_frames_before_writing() {
        let shape = FrameShape::new(8, 8, PixelFormat::Nv12);
        let mut pool = FrameBufferPool::new("frames");
        pool.allocate(2, shape, MemoryDomain::Codec).unwrap();
        let frame = gray_frame(&pool, 120, 128, 128);
        let keep = frame.share();
        let params = TweakParams {
            saturation: 0.0,
            brightness: 0.1,
            ..TweakParams::default()
        };
        let out = TweakFilter::new(shape, &params)
            .transform(Some(frame), &pool)
            .unwrap();
        assert_ne!(out[0].handle.slot_index(), keep.handle.slot_index());
        assert_eq!(keep.handle.lock().sample(0, 0, 0), 120);
        assert!(out[0].handle.lock().sample(0, 0, 0) > 120);
    }

    #[test]
    fn curves_rejects_unsorted_points_and_maps_through_lut() {
        let shape = FrameShape::new(8, 8, PixelFormat::Yuv420);
        let bad = CurvesParams {
            points: vec![[0.5, 0.5], [0.2, 0.9]],
        };
        assert!(CurvesFilter::new(shape, &bad).is_err());
        let invert = CurvesParams {
            points: vec![[0.0, 1.0], [1.0, 0.0]],
        };
        let filter = CurvesFilter::new(shape, &invert).unwrap();
        assert_eq!(filter.map(0), 255);
        assert_eq!(filter.map(255), 0);
    }

    #[test]
    fn colorspace_keeps_neutral_gray() {
        let shape = FrameShape::new(8, 8, PixelFormat::Yuv420);
        let mut pool = FrameBufferPool::new("frames");
        pool.allocate(2, shape, MemoryDomain::GpuImage).unwrap();
        let frame = gray_frame(&pool, 126, 128, 128);
        let mut filter = ColorspaceFilter::new(shape, &ColorspaceParams::default()).unwrap();
        let out = filter.transform(Some(frame), &pool).unwrap();
        let buf = out[0].handle.lock();
        assert_eq!(buf.sample(0, 5, 5), 126);
        assert_eq!(buf.chroma(0, 2, 2), 128);
        assert!(
            ColorspaceFilter::new(
                shape,
                &ColorspaceParams {
                    from: ColorMatrix::Bt709,
                    to: ColorMatrix::Bt709
                }
            )
            .is_err()
        );
    }
}
