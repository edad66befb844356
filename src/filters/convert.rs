use crate::error::{PipelineError, Result};
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::{ChromaLayout, Crop, FrameShape, PixelFormat};

use super::{Filter, FilterKind, map_frame};

/// Pixel format / bit depth conversion with an optional crop.
///
/// Inserted at the edges of compute blocks, where frames move between the codec's
/// native layouts and the planar layouts compute filters work on.
pub struct ConvertFilter {
    input: FrameShape,
    output: FrameShape,
    crop: Crop,
}

impl ConvertFilter {
    pub fn new(input: FrameShape, format: PixelFormat, bit_depth: u8, crop: Crop) -> Result<Self> {
        let (width, height) = crop.apply(input.width, input.height).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "crop {}/{}/{}/{} leaves nothing of a {}x{} frame",
                crop.left, crop.right, crop.top, crop.bottom, input.width, input.height
            ))
        })?;
        let output = input
            .with_size(width, height)
            .with_format(format, bit_depth);
        Ok(Self {
            input,
            output,
            crop,
        })
    }

    pub fn crop(&self) -> Crop {
        self.crop
    }
}

fn subsampling(layout: ChromaLayout) -> usize {
    match layout {
        ChromaLayout::Planar444 => 1,
        _ => 2,
    }
}

fn convert_depth(value: u16, from: u8, to: u8) -> u16 {
    if to >= from {
        value << (to - from)
    } else {
        let shift = from - to;
        ((value as u32 + (1 << (shift - 1))) >> shift).min((1u32 << to) - 1) as u16
    }
}

impl Filter for ConvertFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Convert
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
        let (width, height) = self
            .crop
            .apply(src_shape.width, src_shape.height)
            .unwrap_or((self.output.width, self.output.height));
        let shape = self
            .output
            .with_size(width, height)
            .with_pic_struct(src_shape.pic_struct);
        let crop = self.crop;
        let out = map_frame(frame, pool, shape, FilterKind::Convert, |src, dst| {
            let from = src.shape().bit_depth;
            let to = dst.shape().bit_depth;
            let (left, top) = (crop.left as usize, crop.top as usize);
            let (w, h) = dst.luma_size();
            for y in 0..h {
                for x in 0..w {
                    let v = src.sample(0, x + left, y + top);
                    dst.set_sample(0, x, y, convert_depth(v, from, to));
                }
            }
            let src_sub = subsampling(src.shape().format.chroma());
            let dst_sub = subsampling(dst.shape().format.chroma());
            let (src_cw, src_ch) = src.chroma_size();
            let (cw, ch) = dst.chroma_size();
            for cy in 0..ch {
                let sy = ((cy * dst_sub + top) / src_sub).min(src_ch - 1);
                for cx in 0..cw {
                    let sx = ((cx * dst_sub + left) / src_sub).min(src_cw - 1);
                    for component in 0..2 {
                        let v = src.chroma(component, sx, sy);
                        dst.set_chroma(component, cx, cy, convert_depth(v, from, to));
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
    use crate::pool::FrameBufferPool;
    use crate::video::{FrameMeta, MemoryDomain};

    #[test]
    fn nv12_to_p010_scales_samples_and_crops() {
        let input = FrameShape::new(8, 8, PixelFormat::Nv12);
        let mut src_pool = FrameBufferPool::new("src");
        src_pool.allocate(1, input, MemoryDomain::Codec).unwrap();
        let handle = src_pool.checkout().unwrap();
        {
            let mut buf = handle.lock();
            buf.fill(100, 60, 200);
            buf.set_sample(0, 2, 2, 235);
        }
        let crop = Crop {
            left: 2,
            right: 2,
            top: 2,
            bottom: 0,
        };
        let mut filter = ConvertFilter::new(input, PixelFormat::P010, 10, crop).unwrap();
        let mut dst_pool = FrameBufferPool::new("dst");
        dst_pool
            .allocate(1, filter.output_shape(), MemoryDomain::GpuImage)
            .unwrap();

        let frame = PipelineFrame::new(handle, FrameMeta::new(0, 1, 0));
        let out = filter.transform(Some(frame), &dst_pool).unwrap();
        let buf = out[0].handle.lock();
        assert_eq!((buf.shape().width, buf.shape().height), (4, 6));
        assert_eq!(buf.sample(0, 0, 0), 235 << 2);
        assert_eq!(buf.sample(0, 1, 0), 100 << 2);
        assert_eq!(buf.chroma(1, 0, 0), 200 << 2);
        assert_eq!(src_pool.available(), 1);
    }

    #[test]
    fn depth_reduction_rounds() {
        assert_eq!(convert_depth(1023, 10, 8), 255);
        assert_eq!(convert_depth(514, 10, 8), 129);
        assert_eq!(convert_depth(3, 8, 10), 12);
    }
}
