use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::FrameShape;

use super::{Filter, FilterKind, channel_size, get, map_frame, put};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformParams {
    pub flip_x: bool,
    pub flip_y: bool,
    /// Swap rows and columns; applied before flipping.
    pub transpose: bool,
}

/// Flips and transposition. Rotations are combinations of the three.
pub struct TransformFilter {
    input: FrameShape,
    output: FrameShape,
    params: TransformParams,
}

impl TransformFilter {
    pub fn new(input: FrameShape, params: &TransformParams) -> Result<Self> {
        if !(params.flip_x || params.flip_y || params.transpose) {
            return Err(PipelineError::InvalidParameter(
                "transform enabled without flip_x, flip_y or transpose".into(),
            ));
        }
        let output = if params.transpose {
            input.with_size(input.height, input.width)
        } else {
            input
        };
        Ok(Self {
            input,
            output,
            params: *params,
        })
    }
}

impl Filter for TransformFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Transform
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
        let src_shape = frame.handle.shape();
        let p = self.params;
        let shape = if p.transpose {
            src_shape.with_size(src_shape.height, src_shape.width)
        } else {
            src_shape
        };
        let out = map_frame(frame, pool, shape, FilterKind::Transform, |src, dst| {
            for channel in 0..3 {
                let (dw, dh) = channel_size(dst, channel);
                for y in 0..dh {
                    for x in 0..dw {
                        let tx = if p.flip_x { dw - 1 - x } else { x };
                        let ty = if p.flip_y { dh - 1 - y } else { y };
                        let (sx, sy) = if p.transpose { (ty, tx) } else { (tx, ty) };
                        put(dst, channel, x, y, get(src, channel, sx, sy));
                    }
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

    #[test]
    fn transpose_then_flip_rotates_clockwise() {
        let shape = FrameShape::new(4, 2, PixelFormat::Yuv444);
        let mut pool = FrameBufferPool::new("frames");
        pool.allocate(1, shape, MemoryDomain::GpuImage).unwrap();
        let handle = pool.checkout().unwrap();
        {
            let mut buf = handle.lock();
            buf.fill(0, 128, 128);
            for y in 0..2 {
                for x in 0..4 {
                    buf.set_sample(0, x, y, (y * 4 + x) as u16);
                }
            }
        }
        let params = TransformParams {
            transpose: true,
            flip_x: true,
            flip_y: false,
        };
        let mut filter = TransformFilter::new(shape, &params).unwrap();
        assert_eq!((filter.output_shape().width, filter.output_shape().height), (2, 4));
        let mut rotated = FrameBufferPool::new("rotated");
        rotated
            .allocate(1, filter.output_shape(), MemoryDomain::GpuImage)
            .unwrap();
        let out = filter
            .transform(Some(PipelineFrame::new(handle, FrameMeta::default())), &rotated)
            .unwrap();
        let buf = out[0].handle.lock();
        // Source row 1 becomes the left column.
        assert_eq!(buf.sample(0, 0, 0), 4);
        assert_eq!(buf.sample(0, 1, 0), 0);
        assert_eq!(buf.sample(0, 0, 3), 7);
    }

    #[test]
    fn empty_transform_is_rejected() {
        let shape = FrameShape::new(4, 4, PixelFormat::Yuv420);
        assert!(TransformFilter::new(shape, &TransformParams::default()).is_err());
    }
}
