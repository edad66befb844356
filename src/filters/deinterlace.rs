use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::job::VppParams;
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::{FrameBuffer, FrameShape, PicStruct};

use super::{Filter, FilterKind, channel_size, get, map_frame, put};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AfsParams {
    /// Largest weave/interpolation difference still treated as static.
    pub threshold: u16,
}

impl Default for AfsParams {
    fn default() -> Self {
        Self { threshold: 12 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NnediParams {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct YadifParams {
    /// Emit one frame per field.
    pub bob: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinterlaceMode {
    Afs { threshold: u16 },
    Nnedi,
    Yadif { bob: bool },
}

impl DeinterlaceMode {
    pub fn from_params(kind: FilterKind, params: &VppParams) -> Option<Self> {
        match kind {
            FilterKind::Afs => params.afs.map(|p| DeinterlaceMode::Afs {
                threshold: p.threshold,
            }),
            FilterKind::Nnedi => params.nnedi.map(|_| DeinterlaceMode::Nnedi),
            FilterKind::Yadif => params.yadif.map(|p| DeinterlaceMode::Yadif { bob: p.bob }),
            _ => None,
        }
    }

    fn kind(self) -> FilterKind {
        match self {
            DeinterlaceMode::Afs { .. } => FilterKind::Afs,
            DeinterlaceMode::Nnedi => FilterKind::Nnedi,
            DeinterlaceMode::Yadif { .. } => FilterKind::Yadif,
        }
    }
}

pub struct DeinterlaceFilter {
    input: FrameShape,
    output: FrameShape,
    mode: DeinterlaceMode,
}

impl DeinterlaceFilter {
    pub fn new(input: FrameShape, mode: DeinterlaceMode) -> Result<Self> {
        if !input.pic_struct.has_field_order() {
            return Err(PipelineError::InvalidParameter(format!(
                "{} needs top- or bottom-field-first input, source is {:?}",
                mode.kind(),
                input.pic_struct
            )));
        }
        Ok(Self {
            input,
            output: input.with_pic_struct(PicStruct::Progressive),
            mode,
        })
    }

    fn field_order(&self, frame: &PipelineFrame) -> PicStruct {
        if frame.meta.pic_struct.has_field_order() {
            frame.meta.pic_struct
        } else {
            self.input.pic_struct
        }
    }
}

/// Nearest row of parity `parity` to `row`, inside `0..height`.
fn field_row(row: isize, parity: usize, height: usize) -> usize {
    let last = height as isize - 1;
    let mut r = row.clamp(0, last);
    if (r as usize) % 2 != parity {
        r = if r + 1 <= last { r + 1 } else { r - 1 };
    }
    r.clamp(0, last) as usize
}

fn rebuild_channel(src: &FrameBuffer, dst: &mut FrameBuffer, channel: usize, parity: usize, mode: DeinterlaceMode) {
    let (w, h) = channel_size(src, channel);
    let max = dst.max_value() as i32;
    for y in 0..h {
        let yi = y as isize;
        for x in 0..w {
            if y % 2 == parity || h < 2 {
                put(dst, channel, x, y, get(src, channel, x, y));
                continue;
            }
            let above = get(src, channel, x, field_row(yi - 1, parity, h)) as i32;
            let below = get(src, channel, x, field_row(yi + 1, parity, h)) as i32;
            let linear = (above + below + 1) / 2;
            let value = match mode {
                DeinterlaceMode::Yadif { .. } => linear,
                DeinterlaceMode::Nnedi => {
                    let far_above = get(src, channel, x, field_row(yi - 3, parity, h)) as i32;
                    let far_below = get(src, channel, x, field_row(yi + 3, parity, h)) as i32;
                    (9 * (above + below) - far_above - far_below + 8) / 16
                }
                DeinterlaceMode::Afs { threshold } => {
                    let weave = get(src, channel, x, y) as i32;
                    if (weave - linear).abs() <= threshold as i32 {
                        weave
                    } else {
                        linear
                    }
                }
            };
            put(dst, channel, x, y, value.clamp(0, max) as u16);
        }
    }
}

impl Filter for DeinterlaceFilter {
    fn kind(&self) -> FilterKind {
        self.mode.kind()
    }

    fn input_shape(&self) -> FrameShape {
        self.input
    }

    fn output_shape(&self) -> FrameShape {
        self.output
    }

    fn max_outputs(&self) -> usize {
        match self.mode {
            DeinterlaceMode::Yadif { bob: true } => 2,
            _ => 1,
        }
    }

    fn transform(
        &mut self,
        input: Option<PipelineFrame>,
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let first = if self.field_order(&frame) == PicStruct::Bff { 1 } else { 0 };
        let shape = frame
            .handle
            .shape()
            .with_pic_struct(PicStruct::Progressive);
        let mode = self.mode;
        let kind = self.kind();

        if let DeinterlaceMode::Yadif { bob: true } = mode {
            let second_field = frame.share();
            let half = frame.meta.duration / 2;
            let mut leading = map_frame(frame, pool, shape, kind, |src, dst| {
                for channel in 0..3 {
                    rebuild_channel(src, dst, channel, first, mode);
                }
            })?;
            let mut trailing = map_frame(second_field, pool, shape, kind, |src, dst| {
                for channel in 0..3 {
                    rebuild_channel(src, dst, channel, 1 - first, mode);
                }
            })?;
            trailing.meta.timestamp = leading.meta.timestamp + half;
            trailing.meta.duration = leading.meta.duration - half;
            leading.meta.duration = half;
            return Ok(vec![leading, trailing]);
        }

        let out = map_frame(frame, pool, shape, kind, |src, dst| {
            for channel in 0..3 {
                rebuild_channel(src, dst, channel, first, mode);
            }
        })?;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FrameMeta, MemoryDomain, PixelFormat};

    fn interlaced_frame(pic_struct: PicStruct) -> (FrameBufferPool, PipelineFrame, FrameShape) {
        let shape = FrameShape::new(4, 8, PixelFormat::Yuv420).with_pic_struct(pic_struct);
        let mut pool = FrameBufferPool::new("src");
        pool.allocate(2, shape, MemoryDomain::GpuImage).unwrap();
        let handle = pool.checkout().unwrap();
        {
            let mut buf = handle.lock();
            buf.fill(0, 128, 128);
            for y in 0..8 {
                for x in 0..4 {
                    buf.set_sample(0, x, y, if y % 2 == 0 { 50 } else { 250 });
                }
            }
        }
        let mut meta = FrameMeta::new(100, 10, 0);
        meta.pic_struct = pic_struct;
        (pool, PipelineFrame::new(handle, meta), shape)
    }

    #[test]
    fn progressive_source_is_rejected() {
        let shape = FrameShape::new(4, 8, PixelFormat::Yuv420);
        assert!(matches!(
            DeinterlaceFilter::new(shape, DeinterlaceMode::Yadif { bob: false }),
            Err(PipelineError::InvalidParameter(_))
        ));
        let unknown = shape.with_pic_struct(PicStruct::Interlaced);
        assert!(DeinterlaceFilter::new(unknown, DeinterlaceMode::Nnedi).is_err());
    }

    #[test]
    fn yadif_keeps_top_field_for_tff() {
        let (_src, frame, shape) = interlaced_frame(PicStruct::Tff);
        let mut filter =
            DeinterlaceFilter::new(shape, DeinterlaceMode::Yadif { bob: false }).unwrap();
        let mut out_pool = FrameBufferPool::new("dst");
        out_pool.allocate(1, filter.output_shape(), MemoryDomain::GpuImage).unwrap();
        let out = filter.transform(Some(frame), &out_pool).unwrap();
        assert_eq!(out.len(), 1);
        let buf = out[0].handle.lock();
        for y in 0..8 {
            assert_eq!(buf.sample(0, 1, y), 50);
        }
        assert_eq!(buf.shape().pic_struct, PicStruct::Progressive);
    }

    #[test]
    fn bob_emits_both_fields_with_split_timing() {
        let (_src, frame, shape) = interlaced_frame(PicStruct::Tff);
        let mut filter =
            DeinterlaceFilter::new(shape, DeinterlaceMode::Yadif { bob: true }).unwrap();
        let mut out_pool = FrameBufferPool::new("dst");
        out_pool.allocate(2, filter.output_shape(), MemoryDomain::GpuImage).unwrap();
        let out = filter.transform(Some(frame), &out_pool).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].meta.timestamp, out[0].meta.duration), (100, 5));
        assert_eq!((out[1].meta.timestamp, out[1].meta.duration), (105, 5));
        assert_eq!(out[0].handle.lock().sample(0, 0, 3), 50);
        assert_eq!(out[1].handle.lock().sample(0, 0, 3), 250);
    }
}
