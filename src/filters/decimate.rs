use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::FrameShape;

use super::{Filter, FilterKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecimateParams {
    /// Frames per group; one of them is dropped.
    pub cycle: usize,
}

impl Default for DecimateParams {
    fn default() -> Self {
        Self { cycle: 5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpDecimateParams {
    /// An 8x8 block differing by more than this (sum of absolute differences) keeps the frame.
    pub hi: u32,
    /// Blocks differing by more than this count towards `frac`.
    pub lo: u32,
    pub frac: f32,
    /// Most consecutive drops, 0 for unlimited.
    pub max_drop: usize,
}

impl Default for MpDecimateParams {
    fn default() -> Self {
        Self {
            hi: 64 * 12,
            lo: 64 * 5,
            frac: 0.33,
            max_drop: 0,
        }
    }
}

fn mean_abs_diff(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return f64::MAX;
    }
    let total: u64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| x.abs_diff(*y) as u64)
        .sum();
    total as f64 / a.len() as f64
}

struct Pending {
    frame: PipelineFrame,
    luma: Vec<u8>,
}

/// Drops the frame most similar to its predecessor out of every `cycle` frames.
pub struct DecimateFilter {
    shape: FrameShape,
    cycle: usize,
    group: VecDeque<Pending>,
    previous: Option<Vec<u8>>,
}

impl DecimateFilter {
    pub fn new(input: FrameShape, params: &DecimateParams) -> Result<Self> {
        if params.cycle < 2 {
            return Err(PipelineError::InvalidParameter(format!(
                "decimate cycle must be at least 2, got {}",
                params.cycle
            )));
        }
        Ok(Self {
            shape: input,
            cycle: params.cycle,
            group: VecDeque::with_capacity(params.cycle),
            previous: None,
        })
    }

    fn release_group(&mut self, drop_one: bool) -> Vec<PipelineFrame> {
        let mut group: Vec<Pending> = self.group.drain(..).collect();
        if drop_one && group.len() > 1 {
            let mut victim = 0;
            let mut lowest = f64::MAX;
            for (i, item) in group.iter().enumerate() {
                let prev = if i == 0 {
                    self.previous.as_deref()
                } else {
                    Some(group[i - 1].luma.as_slice())
                };
                let diff = prev.map_or(f64::MAX, |p| mean_abs_diff(p, &item.luma));
                if diff < lowest {
                    lowest = diff;
                    victim = i;
                }
            }
            if lowest == f64::MAX {
                victim = group.len() - 1;
            }
            let dropped = group.remove(victim);
            // The neighbour absorbs the dropped frame's display time.
            if victim > 0 {
                group[victim - 1].frame.meta.duration += dropped.frame.meta.duration;
            } else {
                let next = &mut group[0].frame.meta;
                next.duration += next.timestamp - dropped.frame.meta.timestamp;
                next.timestamp = dropped.frame.meta.timestamp;
            }
        }
        if let Some(last) = group.last() {
            self.previous = Some(last.luma.clone());
        }
        group.into_iter().map(|item| item.frame).collect()
    }
}

impl Filter for DecimateFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Decimate
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

    fn max_outputs(&self) -> usize {
        self.cycle
    }

    fn retained_frames(&self) -> usize {
        self.cycle
    }

    fn transform(
        &mut self,
        input: Option<PipelineFrame>,
        _pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(self.release_group(false));
        };
        let luma = frame.handle.lock().luma_u8();
        self.group.push_back(Pending { frame, luma });
        if self.group.len() < self.cycle {
            return Ok(Vec::new());
        }
        Ok(self.release_group(true))
    }
}

/// Drops frames that barely differ from the last frame kept.
pub struct MpDecimateFilter {
    shape: FrameShape,
    params: MpDecimateParams,
    reference: Option<Vec<u8>>,
    dropped_in_row: usize,
}

impl MpDecimateFilter {
    pub fn new(input: FrameShape, params: &MpDecimateParams) -> Self {
        Self {
            shape: input,
            params: *params,
            reference: None,
            dropped_in_row: 0,
        }
    }

    fn is_duplicate(&self, luma: &[u8], reference: &[u8]) -> bool {
        let (w, h) = (self.shape.width as usize, self.shape.height as usize);
        if luma.len() != w * h || reference.len() != luma.len() {
            return false;
        }
        let mut blocks = 0usize;
        let mut changed = 0usize;
        for by in (0..h).step_by(8) {
            for bx in (0..w).step_by(8) {
                let mut sad = 0u32;
                for y in by..(by + 8).min(h) {
                    for x in bx..(bx + 8).min(w) {
                        sad += luma[y * w + x].abs_diff(reference[y * w + x]) as u32;
                    }
                }
                if sad > self.params.hi {
                    return false;
                }
                if sad > self.params.lo {
                    changed += 1;
                }
                blocks += 1;
            }
        }
        (changed as f32) < self.params.frac * blocks as f32
    }
}

impl Filter for MpDecimateFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::MpDecimate
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
        _pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let luma = frame.handle.lock().luma_u8();
        let limit_reached =
            self.params.max_drop > 0 && self.dropped_in_row >= self.params.max_drop;
        if let Some(reference) = &self.reference
            && !limit_reached
            && self.is_duplicate(&luma, reference)
        {
            self.dropped_in_row += 1;
            return Ok(Vec::new());
        }
        self.dropped_in_row = 0;
        self.reference = Some(luma);
        Ok(vec![frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FrameMeta, MemoryDomain, PixelFormat};

    fn frames(levels: &[u16]) -> (FrameBufferPool, Vec<PipelineFrame>) {
        let shape = FrameShape::new(16, 16, PixelFormat::Nv12);
        let mut pool = FrameBufferPool::new("src");
        pool.allocate(levels.len(), shape, MemoryDomain::Codec).unwrap();
        let frames = levels
            .iter()
            .enumerate()
            .map(|(i, level)| {
                let handle = pool.checkout().unwrap();
                handle.lock().fill(*level, 128, 128);
                PipelineFrame::new(handle, FrameMeta::new(i as i64 * 10, 10, i as u64))
            })
            .collect();
        (pool, frames)
    }

    #[test]
    fn decimate_drops_the_repeated_frame_of_each_cycle() {
        let (pool, input) = frames(&[10, 40, 40, 90, 120]);
        let shape = input[0].handle.shape();
        let mut filter = DecimateFilter::new(shape, &DecimateParams { cycle: 5 }).unwrap();
        let mut out = Vec::new();
        for frame in input {
            out.extend(filter.transform(Some(frame), &pool).unwrap());
        }
        let ids: Vec<u64> = out.iter().map(|f| f.meta.input_frame_id).collect();
        assert_eq!(ids, vec![0, 1, 3, 4]);
        assert_eq!(out[1].meta.duration, 20);
        drop(out);
        assert_eq!(pool.available(), 5);
    }

    #[test]
    fn decimate_flushes_partial_cycle_untouched() {
        let (pool, input) = frames(&[10, 10, 10]);
        let shape = input[0].handle.shape();
        let mut filter = DecimateFilter::new(shape, &DecimateParams::default()).unwrap();
        for frame in input {
            assert!(filter.transform(Some(frame), &pool).unwrap().is_empty());
        }
        assert_eq!(filter.transform(None, &pool).unwrap().len(), 3);
    }

    #[test]
    fn mpdecimate_respects_max_drop() {
        let (pool, input) = frames(&[50, 50, 50, 50, 200]);
        let shape = input[0].handle.shape();
        let params = MpDecimateParams {
            max_drop: 2,
            ..MpDecimateParams::default()
        };
        let mut filter = MpDecimateFilter::new(shape, &params);
        let mut kept = Vec::new();
        for frame in input {
            kept.extend(filter.transform(Some(frame), &pool).unwrap());
        }
        let ids: Vec<u64> = kept.iter().map(|f| f.meta.input_frame_id).collect();
        assert_eq!(ids, vec![0, 3, 4]);
    }
}
