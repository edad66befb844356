use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::VppParams;
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::{FrameBuffer, FrameShape};

use super::{Filter, FilterKind, clamp_sample, copy_channel, get_clamped, map_frame};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsharpParams {
    pub radius: u32,
    pub weight: f32,
    /// Smallest 8-bit detail amplitude that gets sharpened.
    pub threshold: f32,
}

impl Default for UnsharpParams {
    fn default() -> Self {
        Self {
            radius: 3,
            weight: 0.5,
            threshold: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeLevelParams {
    pub strength: f32,
    pub threshold: f32,
    pub black: f32,
    pub white: f32,
}

impl Default for EdgeLevelParams {
    fn default() -> Self {
        Self {
            strength: 5.0,
            threshold: 20.0,
            black: 0.0,
            white: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpSharpParams {
    pub threshold: f32,
    pub blur: u32,
    pub depth: f32,
}

impl Default for WarpSharpParams {
    fn default() -> Self {
        Self {
            threshold: 128.0,
            blur: 2,
            depth: 16.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SharpenMode {
    Unsharp(UnsharpParams),
    EdgeLevel(EdgeLevelParams),
    WarpSharp(WarpSharpParams),
}

impl SharpenMode {
    pub fn from_params(kind: FilterKind, params: &VppParams) -> Option<Self> {
        match kind {
            FilterKind::Unsharp => params.unsharp.map(SharpenMode::Unsharp),
            FilterKind::EdgeLevel => params.edgelevel.map(SharpenMode::EdgeLevel),
            FilterKind::WarpSharp => params.warpsharp.map(SharpenMode::WarpSharp),
            _ => None,
        }
    }

    fn kind(&self) -> FilterKind {
        match self {
            SharpenMode::Unsharp(_) => FilterKind::Unsharp,
            SharpenMode::EdgeLevel(_) => FilterKind::EdgeLevel,
            SharpenMode::WarpSharp(_) => FilterKind::WarpSharp,
        }
    }
}

fn depth_scale(buf: &FrameBuffer) -> f32 {
    (1u32 << buf.shape().bit_depth.saturating_sub(8)) as f32
}

fn luma_plane(src: &FrameBuffer) -> (usize, usize, Vec<f32>) {
    let (w, h) = src.luma_size();
    let mut plane = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            plane.push(src.sample(0, x, y) as f32);
        }
    }
    (w, h, plane)
}

fn blur_plane(plane: &[f32], w: usize, h: usize, radius: usize) -> Vec<f32> {
    let r = radius as isize;
    let mut out = vec![0.0; plane.len()];
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0;
            let mut count = 0.0;
            for dy in -r..=r {
                let sy = (y as isize + dy).clamp(0, h as isize - 1) as usize;
                for dx in -r..=r {
                    let sx = (x as isize + dx).clamp(0, w as isize - 1) as usize;
                    sum += plane[sy * w + sx];
                    count += 1.0;
                }
            }
            out[y * w + x] = sum / count;
        }
    }
    out
}

fn unsharp(src: &FrameBuffer, dst: &mut FrameBuffer, params: &UnsharpParams) {
    let (w, h, plane) = luma_plane(src);
    let blurred = blur_plane(&plane, w, h, params.radius as usize);
    let threshold = params.threshold * depth_scale(src);
    let max = dst.max_value();
    for y in 0..h {
        for x in 0..w {
            let c = plane[y * w + x];
            let detail = c - blurred[y * w + x];
            let value = if detail.abs() >= threshold {
                c + params.weight * detail
            } else {
                c
            };
            dst.set_sample(0, x, y, clamp_sample(value, max));
        }
    }
}

fn edge_level(src: &FrameBuffer, dst: &mut FrameBuffer, params: &EdgeLevelParams) {
    let (w, h) = src.luma_size();
    let scale = depth_scale(src);
    let threshold = params.threshold * scale;
    let max = dst.max_value();
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as isize, y as isize);
            let c = src.sample(0, x, y) as f32;
            let mut lo = c;
            let mut hi = c;
            for (dx, dy) in [(-2, 0), (-1, 0), (1, 0), (2, 0), (0, -2), (0, -1), (0, 1), (0, 2)] {
                let v = get_clamped(src, 0, xi + dx, yi + dy) as f32;
                lo = lo.min(v);
                hi = hi.max(v);
            }
            let mut value = c;
            if hi - lo > threshold {
                let mid = (hi + lo) * 0.5;
                value += (c - mid) * params.strength / 16.0;
                if (c - lo) < (hi - lo) * 0.25 {
                    value -= params.black * scale;
                } else if (hi - c) < (hi - lo) * 0.25 {
                    value += params.white * scale;
                }
                value = value.clamp(lo - params.black * scale, hi + params.white * scale);
            }
            dst.set_sample(0, x, y, clamp_sample(value, max));
        }
    }
}

fn warp_sharp(src: &FrameBuffer, dst: &mut FrameBuffer, params: &WarpSharpParams) {
    let (w, h, plane) = luma_plane(src);
    let threshold = params.threshold * depth_scale(src);
    let at = |p: &[f32], x: isize, y: isize| -> f32 {
        let sx = x.clamp(0, w as isize - 1) as usize;
        let sy = y.clamp(0, h as isize - 1) as usize;
        p[sy * w + sx]
    };
    let mut edges = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as isize, y as isize);
            let gx = at(&plane, xi + 1, yi) - at(&plane, xi - 1, yi);
            let gy = at(&plane, xi, yi + 1) - at(&plane, xi, yi - 1);
            edges[y * w + x] = (gx.abs() + gy.abs()).min(threshold);
        }
    }
    let edges = blur_plane(&edges, w, h, params.blur as usize);
    let max = dst.max_value();
    let gain = params.depth / threshold.max(1.0);
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as isize, y as isize);
            let dx = (at(&edges, xi + 1, yi) - at(&edges, xi - 1, yi)) * gain;
            let dy = (at(&edges, xi, yi + 1) - at(&edges, xi, yi - 1)) * gain;
            let fx = (x as f32 - dx).clamp(0.0, (w - 1) as f32);
            let fy = (y as f32 - dy).clamp(0.0, (h - 1) as f32);
            let (x0, y0) = (fx as usize, fy as usize);
            let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
            let (wx, wy) = (fx - x0 as f32, fy - y0 as f32);
            let top = plane[y0 * w + x0] * (1.0 - wx) + plane[y0 * w + x1] * wx;
            let bottom = plane[y1 * w + x0] * (1.0 - wx) + plane[y1 * w + x1] * wx;
            dst.set_sample(0, x, y, clamp_sample(top * (1.0 - wy) + bottom * wy, max));
        }
    }
}

/// Luma sharpeners; chroma is passed through.
pub struct SharpenFilter {
    shape: FrameShape,
    mode: SharpenMode,
}

impl SharpenFilter {
    pub fn new(input: FrameShape, mode: SharpenMode) -> Self {
        Self { shape: input, mode }
    }
}

impl Filter for SharpenFilter {
    fn kind(&self) -> FilterKind {
        self.mode.kind()
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
        let mode = self.mode;
        let out = map_frame(frame, pool, shape, mode.kind(), |src, dst| {
            match &mode {
                SharpenMode::Unsharp(p) => unsharp(src, dst, p),
                SharpenMode::EdgeLevel(p) => edge_level(src, dst, p),
                SharpenMode::WarpSharp(p) => warp_sharp(src, dst, p),
            }
            for channel in 1..3 {
                copy_channel(src, dst, channel);
            }
        })?;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FrameMeta, MemoryDomain, PixelFormat};

    fn luma_contrast(buf: &FrameBuffer) -> f32 {
        let (w, h) = buf.luma_size();
        let mut lo = u16::MAX;
        let mut hi = 0;
        for y in 0..h {
            for x in 0..w {
                let v = buf.sample(0, x, y);
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
        (hi - lo) as f32
    }

    fn edge_frame(pool: &FrameBufferPool) -> PipelineFrame {
        let handle = pool.checkout().unwrap();
        {
            let mut buf = handle.lock();
            buf.fill(0, 100, 150);
            for y in 0..16 {
                for x in 0..16 {
                    let v = if x < 8 { 80 } else { 160 };
                    buf.set_sample(0, x, y, v);
                }
            }
        }
        PipelineFrame::new(handle, FrameMeta::default())
    }

    fn run(mode: SharpenMode) -> (f32, u16, u16) {
        let shape = FrameShape::new(16, 16, PixelFormat::Yuv420);
        let mut src = FrameBufferPool::new("src");
        src.allocate(1, shape, MemoryDomain::GpuImage).unwrap();
        let mut dst = FrameBufferPool::new("dst");
        dst.allocate(1, shape, MemoryDomain::GpuImage).unwrap();
        let mut filter = SharpenFilter::new(shape, mode);
        let out = filter.transform(Some(edge_frame(&src)), &dst).unwrap();
        let buf = out[0].handle.lock();
        (luma_contrast(&buf), buf.chroma(0, 3, 3), buf.chroma(1, 3, 3))
    }

    #[test]
    fn unsharp_increases_edge_contrast_and_keeps_chroma() {
        let (contrast, u, v) = run(SharpenMode::Unsharp(UnsharpParams::default()));
        assert!(contrast > 80.0);
        assert_eq!((u, v), (100, 150));
    }

    #[test]
    fn edgelevel_increases_edge_contrast() {
        let (contrast, _, _) = run(SharpenMode::EdgeLevel(EdgeLevelParams {
            black: 4.0,
            white: 4.0,
            ..EdgeLevelParams::default()
        }));
        assert!(contrast > 80.0);
    }

    #[test]
    fn warpsharp_stays_within_source_range() {
        let (contrast, _, _) = run(SharpenMode::WarpSharp(WarpSharpParams::default()));
        assert!(contrast <= 80.0);
    }
}
