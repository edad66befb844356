use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::VppParams;
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::{FrameBuffer, FrameShape};

use super::{Filter, FilterKind, channel_size, clamp_sample, get, get_clamped, map_frame, put};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Convolution3dParams {
    /// Largest 8-bit difference to a neighbour in the same frame that still gets blended.
    pub threshold_spatial: u16,
    /// Same, for neighbours in the previous and next frame.
    pub threshold_temporal: u16,
}

impl Default for Convolution3dParams {
    fn default() -> Self {
        Self {
            threshold_spatial: 3,
            threshold_temporal: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothParams {
    pub radius: u32,
}

impl Default for SmoothParams {
    fn default() -> Self {
        Self { radius: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnnParams {
    pub radius: u32,
    pub strength: f32,
}

impl Default for KnnParams {
    fn default() -> Self {
        Self {
            radius: 3,
            strength: 0.08,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmdParams {
    pub iterations: u32,
    /// Diffusion rate, 0 to 100.
    pub strength: f32,
    /// Edge-stopping gradient in 8-bit units.
    pub threshold: f32,
}

impl Default for PmdParams {
    fn default() -> Self {
        Self {
            iterations: 2,
            strength: 100.0,
            threshold: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebandParams {
    pub range: u32,
    /// Largest 8-bit difference still considered banding.
    pub threshold: u16,
    pub seed: u32,
}

impl Default for DebandParams {
    fn default() -> Self {
        Self {
            range: 15,
            threshold: 15,
            seed: 1234,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DenoiseMode {
    Convolution3d { spatial: u16, temporal: u16 },
    Smooth { radius: u32 },
    Knn { radius: u32, strength: f32 },
    Pmd { iterations: u32, strength: f32, threshold: f32 },
    Deband { range: u32, threshold: u16, seed: u32 },
}

impl DenoiseMode {
    pub fn from_params(kind: FilterKind, params: &VppParams) -> Option<Self> {
        match kind {
            FilterKind::Convolution3d => params.convolution3d.map(|p| DenoiseMode::Convolution3d {
                spatial: p.threshold_spatial,
                temporal: p.threshold_temporal,
            }),
            FilterKind::Smooth => params.smooth.map(|p| DenoiseMode::Smooth { radius: p.radius }),
            FilterKind::Knn => params.knn.map(|p| DenoiseMode::Knn {
                radius: p.radius,
                strength: p.strength,
            }),
            FilterKind::Pmd => params.pmd.map(|p| DenoiseMode::Pmd {
                iterations: p.iterations,
                strength: p.strength,
                threshold: p.threshold,
            }),
            FilterKind::Deband => params.deband.map(|p| DenoiseMode::Deband {
                range: p.range,
                threshold: p.threshold,
                seed: p.seed,
            }),
            _ => None,
        }
    }

    fn kind(self) -> FilterKind {
        match self {
            DenoiseMode::Convolution3d { .. } => FilterKind::Convolution3d,
            DenoiseMode::Smooth { .. } => FilterKind::Smooth,
            DenoiseMode::Knn { .. } => FilterKind::Knn,
            DenoiseMode::Pmd { .. } => FilterKind::Pmd,
            DenoiseMode::Deband { .. } => FilterKind::Deband,
        }
    }
}

/// Per-channel samples of a frame, kept after its buffer went back to the pool.
type Snapshot = [Vec<u16>; 3];

fn snapshot(buf: &FrameBuffer) -> Snapshot {
    std::array::from_fn(|channel| {
        let (w, h) = channel_size(buf, channel);
        let mut samples = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                samples.push(get(buf, channel, x, y));
            }
        }
        samples
    })
}

fn scale_threshold(threshold: u16, bit_depth: u8) -> i32 {
    (threshold as i32) << bit_depth.saturating_sub(8)
}

fn box_blur(src: &FrameBuffer, dst: &mut FrameBuffer, channel: usize, radius: u32) {
    let (w, h) = channel_size(src, channel);
    let r = radius as isize;
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0u32;
            let mut count = 0u32;
            for dy in -r..=r {
                for dx in -r..=r {
                    sum += get_clamped(src, channel, x as isize + dx, y as isize + dy) as u32;
                    count += 1;
                }
            }
            put(dst, channel, x, y, ((sum + count / 2) / count) as u16);
        }
    }
}

fn knn(src: &FrameBuffer, dst: &mut FrameBuffer, channel: usize, radius: u32, strength: f32) {
    let (w, h) = channel_size(src, channel);
    let max = dst.max_value();
    let r = radius as isize;
    let h_sq = (strength.max(1e-4) * max as f32).powi(2);
    for y in 0..h {
        for x in 0..w {
            let center = get(src, channel, x, y) as f32;
            let mut weighted = 0.0f32;
            let mut total = 0.0f32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let v = get_clamped(src, channel, x as isize + dx, y as isize + dy) as f32;
                    let weight = (-(v - center).powi(2) / h_sq).exp();
                    weighted += weight * v;
                    total += weight;
                }
            }
            put(dst, channel, x, y, clamp_sample(weighted / total, max));
        }
    }
}

fn pmd(src: &FrameBuffer, dst: &mut FrameBuffer, channel: usize, iterations: u32, strength: f32, threshold: f32) {
    let (w, h) = channel_size(src, channel);
    let max = dst.max_value();
    let scale = (1u32 << dst.shape().bit_depth.saturating_sub(8)) as f32;
    let k = (threshold * scale).max(1e-3);
    let lambda = (strength / 100.0).clamp(0.0, 1.0) * 0.25;
    let mut plane: Vec<f32> = (0..h)
        .flat_map(|y| (0..w).map(move |x| (x, y)))
        .map(|(x, y)| get(src, channel, x, y) as f32)
        .collect();
    let mut next = plane.clone();
    for _ in 0..iterations {
        for y in 0..h {
            for x in 0..w {
                let c = plane[y * w + x];
                let mut flow = 0.0;
                let neighbours = [
                    (x.wrapping_sub(1), y),
                    (x + 1, y),
                    (x, y.wrapping_sub(1)),
                    (x, y + 1),
                ];
                for (nx, ny) in neighbours {
                    if nx < w && ny < h {
                        let d = plane[ny * w + nx] - c;
                        flow += (-(d / k).powi(2)).exp() * d;
                    }
                }
                next[y * w + x] = c + lambda * flow;
            }
        }
        std::mem::swap(&mut plane, &mut next);
    }
    for y in 0..h {
        for x in 0..w {
            put(dst, channel, x, y, clamp_sample(plane[y * w + x], max));
        }
    }
}

fn hash(x: usize, y: usize, seed: u32) -> u32 {
    let mut v = (x as u32).wrapping_mul(0x9E37_79B1) ^ (y as u32).wrapping_mul(0x85EB_CA77) ^ seed;
    v ^= v >> 15;
    v = v.wrapping_mul(0x2C1B_3C6D);
    v ^ (v >> 12)
}

fn deband(src: &FrameBuffer, dst: &mut FrameBuffer, channel: usize, range: u32, threshold: u16, seed: u32) {
    let (w, h) = channel_size(src, channel);
    let limit = scale_threshold(threshold, dst.shape().bit_depth);
    let range = if channel == 0 { range } else { range.div_ceil(2) }.max(1);
    for y in 0..h {
        for x in 0..w {
            let c = get(src, channel, x, y) as i32;
            let offset = (hash(x, y, seed.wrapping_add(channel as u32)) % (range + 1)) as isize;
            let (xi, yi) = (x as isize, y as isize);
            let refs = [
                get_clamped(src, channel, xi - offset, yi - offset) as i32,
                get_clamped(src, channel, xi + offset, yi + offset) as i32,
                get_clamped(src, channel, xi - offset, yi + offset) as i32,
                get_clamped(src, channel, xi + offset, yi - offset) as i32,
            ];
            let flat = refs.iter().all(|r| (r - c).abs() < limit);
            let value = if flat { (refs.iter().sum::<i32>() + 2) / 4 } else { c };
            put(dst, channel, x, y, value as u16);
        }
    }
}

fn convolve3d(
    prev: &Snapshot,
    src: &FrameBuffer,
    next: &Snapshot,
    dst: &mut FrameBuffer,
    channel: usize,
    spatial: i32,
    temporal: i32,
) {
    const TAPS: [i32; 3] = [1, 2, 1];
    let (w, h) = channel_size(src, channel);
    for y in 0..h {
        for x in 0..w {
            let c = get(src, channel, x, y) as i32;
            let mut sum = 0i32;
            for (t, wt) in TAPS.iter().enumerate() {
                for (j, wy) in TAPS.iter().enumerate() {
                    for (i, wx) in TAPS.iter().enumerate() {
                        let sx = (x as isize + i as isize - 1).clamp(0, w as isize - 1) as usize;
                        let sy = (y as isize + j as isize - 1).clamp(0, h as isize - 1) as usize;
                        let (v, limit) = match t {
                            0 => (prev[channel][sy * w + sx] as i32, temporal),
                            1 => (get(src, channel, sx, sy) as i32, spatial),
                            _ => (next[channel][sy * w + sx] as i32, temporal),
                        };
                        let v = if (v - c).abs() <= limit { v } else { c };
                        sum += v * wt * wy * wx;
                    }
                }
            }
            put(dst, channel, x, y, ((sum + 32) / 64) as u16);
        }
    }
}

/// Spatial and temporal noise reduction.
pub struct DenoiseFilter {
    shape: FrameShape,
    mode: DenoiseMode,
    // Temporal state for convolution3d.
    previous: Option<Snapshot>,
    current: Option<PipelineFrame>,
}

impl DenoiseFilter {
    pub fn new(input: FrameShape, mode: DenoiseMode) -> Self {
        Self {
            shape: input,
            mode,
            previous: None,
            current: None,
        }
    }

    fn temporal(
        &mut self,
        next: Option<PipelineFrame>,
        pool: &FrameBufferPool,
        spatial: u16,
        temporal: u16,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(current) = self.current.take() else {
            self.current = next;
            return Ok(Vec::new());
        };
        let current_snapshot = snapshot(&current.handle.lock());
        let next_snapshot = match &next {
            Some(frame) => snapshot(&frame.handle.lock()),
            None => current_snapshot.clone(),
        };
        let prev_snapshot = self
            .previous
            .replace(current_snapshot.clone())
            .unwrap_or(current_snapshot);
        let depth = self.shape.bit_depth;
        let (spatial, temporal) = (scale_threshold(spatial, depth), scale_threshold(temporal, depth));
        let shape = current.handle.shape();
        let out = map_frame(current, pool, shape, FilterKind::Convolution3d, |src, dst| {
            for channel in 0..3 {
                convolve3d(&prev_snapshot, src, &next_snapshot, dst, channel, spatial, temporal);
            }
        })?;
        self.current = next;
        Ok(vec![out])
    }
}

impl Filter for DenoiseFilter {
    fn kind(&self) -> FilterKind {
        self.mode.kind()
    }

    fn input_shape(&self) -> FrameShape {
        self.shape
    }

    fn output_shape(&self) -> FrameShape {
        self.shape
    }

    fn retained_frames(&self) -> usize {
        match self.mode {
            DenoiseMode::Convolution3d { .. } => 1,
            _ => 0,
        }
    }

    fn transform(
        &mut self,
        input: Option<PipelineFrame>,
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let mode = self.mode;
        if let DenoiseMode::Convolution3d { spatial, temporal } = mode {
            return self.temporal(input, pool, spatial, temporal);
        }
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let shape = frame.handle.shape();
        let out = map_frame(frame, pool, shape, mode.kind(), |src, dst| {
            for channel in 0..3 {
                match mode {
                    DenoiseMode::Smooth { radius } => box_blur(src, dst, channel, radius),
                    DenoiseMode::Knn { radius, strength } => knn(src, dst, channel, radius, strength),
                    DenoiseMode::Pmd {
                        iterations,
                        strength,
                        threshold,
                    } => pmd(src, dst, channel, iterations, strength, threshold),
                    DenoiseMode::Deband {
                        range,
                        threshold,
                        seed,
                    } => deband(src, dst, channel, range, threshold, seed),
                    DenoiseMode::Convolution3d { .. } => {}
                }
            }
        })?;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FrameMeta, MemoryDomain, PixelFormat};

    fn pool_with(shape: FrameShape, count: usize) -> FrameBufferPool {
        let mut pool = FrameBufferPool::new("test");
        pool.allocate(count, shape, MemoryDomain::GpuImage).unwrap();
        pool
    }

    #[test]
    fn smooth_flattens_an_isolated_spike() {
        let shape = FrameShape::new(8, 8, PixelFormat::Yuv420);
        let src = pool_with(shape, 1);
        let dst = pool_with(shape, 1);
        let handle = src.checkout().unwrap();
        {
            let mut buf = handle.lock();
            buf.fill(90, 128, 128);
            buf.set_sample(0, 4, 4, 180);
        }
        let mut filter = DenoiseFilter::new(shape, DenoiseMode::Smooth { radius: 1 });
        let out = filter
            .transform(Some(PipelineFrame::new(handle, FrameMeta::default())), &dst)
            .unwrap();
        let buf = out[0].handle.lock();
        assert_eq!(buf.sample(0, 4, 4), 100);
        assert_eq!(buf.sample(0, 0, 0), 90);
        assert_eq!(buf.chroma(1, 2, 2), 128);
    }

    #[test]
    fn convolution3d_delays_by_one_frame_and_flushes() {
        let shape = FrameShape::new(8, 8, PixelFormat::Yuv420);
        let src = pool_with(shape, 3);
        let dst = pool_with(shape, 3);
        let mut filter = DenoiseFilter::new(
            shape,
            DenoiseMode::Convolution3d {
                spatial: 3,
                temporal: 3,
            },
        );
        assert_eq!(filter.retained_frames(), 1);
        let mut emitted = 0;
        for i in 0..3 {
            let handle = src.checkout().unwrap();
            handle.lock().fill(60 + i, 128, 128);
            let meta = FrameMeta::new(i as i64, 1, i as u64);
            let out = filter
                .transform(Some(PipelineFrame::new(handle, meta)), &dst)
                .unwrap();
            assert_eq!(out.len(), if i == 0 { 0 } else { 1 });
            emitted += out.len();
        }
        let tail = filter.transform(None, &dst).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].meta.input_frame_id, 2);
        assert_eq!(emitted + tail.len(), 3);
        assert_eq!(src.available(), 3);
    }

    #[test]
    fn deband_leaves_edges_alone() {
        let shape = FrameShape::new(16, 16, PixelFormat::Yuv420);
        let src = pool_with(shape, 1);
        let dst = pool_with(shape, 1);
        let handle = src.checkout().unwrap();
        {
            let mut buf = handle.lock();
            buf.fill(128, 128, 128);
            for y in 0..16 {
                for x in 8..16 {
                    buf.set_sample(0, x, y, 240);
                }
            }
        }
        let mut filter = DenoiseFilter::new(
            shape,
            DenoiseMode::Deband {
                range: 4,
                threshold: 10,
                seed: 7,
            },
        );
        let out = filter
            .transform(Some(PipelineFrame::new(handle, FrameMeta::default())), &dst)
            .unwrap();
        let buf = out[0].handle.lock();
        assert_eq!(buf.sample(0, 0, 0), 128);
        assert_eq!(buf.sample(0, 15, 15), 240);
    }
}
