use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::FrameShape;

use super::{Filter, FilterKind, black_level, channel_size, get, map_frame, put};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PadParams {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl PadParams {
    pub fn horizontal(&self) -> u32 {
        self.left + self.right
    }

    pub fn vertical(&self) -> u32 {
        self.top + self.bottom
    }
}

/// Adds black borders around the picture.
pub struct PadFilter {
    input: FrameShape,
    output: FrameShape,
    pad: PadParams,
}

impl PadFilter {
    pub fn new(input: FrameShape, pad: &PadParams) -> Result<Self> {
        if [pad.left, pad.right, pad.top, pad.bottom]
            .iter()
            .any(|edge| edge % 2 != 0)
        {
            return Err(PipelineError::InvalidParameter(format!(
                "pad edges must be even, got {}/{}/{}/{}",
                pad.left, pad.right, pad.top, pad.bottom
            )));
        }
        let output = input.with_size(
            input.width + pad.horizontal(),
            input.height + pad.vertical(),
        );
        Ok(Self {
            input,
            output,
            pad: *pad,
        })
    }
}

impl Filter for PadFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Pad
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
        let shape = self
            .output
            .with_size(
                src_shape.width + self.pad.horizontal(),
                src_shape.height + self.pad.vertical(),
            )
            .with_pic_struct(src_shape.pic_struct);
        let pad = self.pad;
        let out = map_frame(frame, pool, shape, FilterKind::Pad, |src, dst| {
            let (y, u, v) = black_level(dst.shape().bit_depth);
            dst.fill(y, u, v);
            for channel in 0..3 {
                let (sw, sh) = channel_size(src, channel);
                let (dw, _) = channel_size(dst, channel);
                let scale = if channel == 0 || dw == dst.luma_size().0 { 1 } else { 2 };
                let (ox, oy) = (pad.left as usize / scale, pad.top as usize / scale);
                for row in 0..sh {
                    for col in 0..sw {
                        put(dst, channel, col + ox, row + oy, get(src, channel, col, row));
                    }
                }
            }
        })?;
        Ok(vec![out])
    }
}
