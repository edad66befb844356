use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pool::FrameBufferPool;
use crate::stages::{Backend, PipelineFrame};
use crate::video::{FrameBuffer, FrameShape};

use super::{Filter, FilterKind, channel_size, clamp_sample, get, map_frame, put};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeAlgorithm {
    #[default]
    Bilinear,
    Nearest,
}

/// Which engine scales frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeEngine {
    /// Fixed-function scaler when the device has one, compute otherwise.
    #[default]
    Auto,
    Compute,
    FixedFunction,
}

pub struct ResizeFilter {
    input: FrameShape,
    output: FrameShape,
    algorithm: ResizeAlgorithm,
    backend: Backend,
}

impl ResizeFilter {
    pub fn new(
        input: FrameShape,
        width: u32,
        height: u32,
        algorithm: ResizeAlgorithm,
        backend: Backend,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidParameter(format!(
                "resize target {width}x{height} is empty"
            )));
        }
        // The fixed-function scaler has a single nearest-neighbour mode and
        // reads codec layouts directly.
        let algorithm = match backend {
            Backend::FixedFunction => {
                if input.format.is_compute_native() {
                    return Err(PipelineError::UnsupportedOperation(format!(
                        "fixed-function scaler cannot read {}",
                        input.format
                    )));
                }
                ResizeAlgorithm::Nearest
            }
            _ => algorithm,
        };
        Ok(Self {
            input,
            output: input.with_size(width, height),
            algorithm,
            backend,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

fn scale_channel(
    src: &FrameBuffer,
    dst: &mut FrameBuffer,
    channel: usize,
    algorithm: ResizeAlgorithm,
) {
    let (sw, sh) = channel_size(src, channel);
    let (dw, dh) = channel_size(dst, channel);
    let max = dst.max_value();
    let x_ratio = sw as f32 / dw as f32;
    let y_ratio = sh as f32 / dh as f32;
    for y in 0..dh {
        let fy = ((y as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let y0 = (fy as usize).min(sh - 1);
        let y1 = (y0 + 1).min(sh - 1);
        let wy = fy - y0 as f32;
        for x in 0..dw {
            let fx = ((x as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let x0 = (fx as usize).min(sw - 1);
            let value = match algorithm {
                ResizeAlgorithm::Nearest => {
                    let nx = ((x as f32 + 0.5) * x_ratio) as usize;
                    let ny = ((y as f32 + 0.5) * y_ratio) as usize;
                    get(src, channel, nx.min(sw - 1), ny.min(sh - 1))
                }
                ResizeAlgorithm::Bilinear => {
                    let x1 = (x0 + 1).min(sw - 1);
                    let wx = fx - x0 as f32;
                    let top = get(src, channel, x0, y0) as f32 * (1.0 - wx)
                        + get(src, channel, x1, y0) as f32 * wx;
                    let bottom = get(src, channel, x0, y1) as f32 * (1.0 - wx)
                        + get(src, channel, x1, y1) as f32 * wx;
                    clamp_sample(top * (1.0 - wy) + bottom * wy, max)
                }
            };
            put(dst, channel, x, y, value);
        }
    }
}

impl Filter for ResizeFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Resize
    }

    fn input_shape(&self) -> FrameShape {
        self.input
    }

    fn output_shape(&self) -> FrameShape {
        self.output
    }

    fn transform(
        &mut self,
        input: Option<PipelineFrame>,
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let shape = self
            .output
            .with_pic_struct(frame.handle.shape().pic_struct);
        let algorithm = self.algorithm;
        let out = map_frame(frame, pool, shape, FilterKind::Resize, |src, dst| {
            for channel in 0..3 {
                scale_channel(src, dst, channel, algorithm);
            }
        })?;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FrameMeta, MemoryDomain, PixelFormat};

    fn frame_from(shape: FrameShape, fill: impl Fn(usize, usize) -> u16) -> (FrameBufferPool, PipelineFrame) {
        let mut pool = FrameBufferPool::new("src");
        pool.allocate(1, shape, MemoryDomain::GpuImage).unwrap();
        let handle = pool.checkout().unwrap();
        {
            let mut buf = handle.lock();
            buf.fill(0, 128, 128);
            for y in 0..shape.height as usize {
                for x in 0..shape.width as usize {
                    buf.set_sample(0, x, y, fill(x, y));
                }
            }
        }
        (pool, PipelineFrame::new(handle, FrameMeta::default()))
    }

    #[test]
    fn bilinear_downscale_averages_neighbours() {
        let shape = FrameShape::new(4, 4, PixelFormat::Yuv420);
        let (_src, frame) = frame_from(shape, |x, _| if x % 2 == 0 { 0 } else { 200 });
        let mut filter =
            ResizeFilter::new(shape, 2, 2, ResizeAlgorithm::Bilinear, Backend::Compute).unwrap();
        let mut out_pool = FrameBufferPool::new("dst");
        out_pool
            .allocate(1, filter.output_shape(), MemoryDomain::GpuImage)
            .unwrap();
        let out = filter.transform(Some(frame), &out_pool).unwrap();
        let buf = out[0].handle.lock();
        assert_eq!(buf.luma_size(), (2, 2));
        assert_eq!(buf.sample(0, 0, 0), 100);
        assert_eq!(buf.chroma(0, 0, 0), 128);
    }

    #[test]
    fn fixed_function_rejects_planar_input() {
        let shape = FrameShape::new(4, 4, PixelFormat::Yuv420);
        assert!(matches!(
            ResizeFilter::new(shape, 2, 2, ResizeAlgorithm::Bilinear, Backend::FixedFunction),
            Err(PipelineError::UnsupportedOperation(_))
        ));
        let nv12 = FrameShape::new(4, 4, PixelFormat::Nv12);
        let filter =
            ResizeFilter::new(nv12, 8, 8, ResizeAlgorithm::Bilinear, Backend::FixedFunction)
                .unwrap();
        assert_eq!(filter.algorithm, ResizeAlgorithm::Nearest);
    }
}
