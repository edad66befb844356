use crate::error::{PipelineError, Result};

use super::{ChromaLayout, FrameShape, MemoryDomain};

const STRIDE_ALIGN: usize = 16;

#[derive(Debug)]
struct Plane {
    data: Vec<u8>,
    stride: usize,
}

/// Planar picture storage in a single memory domain.
///
/// A buffer is allocated for a `capacity` shape and may later hold any picture of the
/// same format that fits inside it. Contents are left untouched between uses.
#[derive(Debug)]
pub struct FrameBuffer {
    capacity: FrameShape,
    shape: FrameShape,
    domain: MemoryDomain,
    planes: Vec<Plane>,
}

impl FrameBuffer {
    pub fn allocate(shape: FrameShape, domain: MemoryDomain) -> Result<Self> {
        if shape.is_empty() {
            return Err(PipelineError::Allocation(format!(
                "cannot allocate an empty frame ({shape})"
            )));
        }
        let bps = shape.format.bytes_per_sample();
        let mut planes = Vec::with_capacity(shape.format.plane_count());
        for plane in 0..shape.format.plane_count() {
            let (width, height) = shape.plane_size(plane);
            let stride = (width * bps).next_multiple_of(STRIDE_ALIGN);
            let size = stride * height;
            let mut data = Vec::new();
            data.try_reserve_exact(size).map_err(|err| {
                PipelineError::Allocation(format!("plane {plane} of {shape}: {err}"))
            })?;
            data.resize(size, 0);
            planes.push(Plane { data, stride });
        }
        Ok(Self {
            capacity: shape,
            shape,
            domain,
            planes,
        })
    }

    pub fn shape(&self) -> &FrameShape {
        &self.shape
    }

    pub fn capacity(&self) -> &FrameShape {
        &self.capacity
    }

    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    /// Declares the picture the buffer currently holds.
    pub fn reshape(&mut self, shape: FrameShape) -> Result<()> {
        if !self.capacity.can_hold(&shape) {
            return Err(PipelineError::InvalidOperation(format!(
                "buffer allocated for {} cannot hold {shape}",
                self.capacity
            )));
        }
        self.shape = shape;
        Ok(())
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn stride(&self, plane: usize) -> usize {
        self.planes[plane].stride
    }

    pub fn plane_size(&self, plane: usize) -> (usize, usize) {
        self.shape.plane_size(plane)
    }

    pub fn max_value(&self) -> u16 {
        self.shape.max_sample()
    }

    #[inline]
    pub fn sample(&self, plane: usize, x: usize, y: usize) -> u16 {
        let p = &self.planes[plane];
        if self.capacity.format.is_wide() {
            let offset = y * p.stride + x * 2;
            u16::from_le_bytes([p.data[offset], p.data[offset + 1]])
        } else {
            p.data[y * p.stride + x] as u16
        }
    }

    #[inline]
    pub fn set_sample(&mut self, plane: usize, x: usize, y: usize, value: u16) {
        let wide = self.capacity.format.is_wide();
        let p = &mut self.planes[plane];
        if wide {
            let offset = y * p.stride + x * 2;
            p.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        } else {
            p.data[y * p.stride + x] = value.min(255) as u8;
        }
    }

    /// Chroma sample `component` (0 = U, 1 = V) at chroma-grid position (`cx`, `cy`).
    #[inline]
    pub fn chroma(&self, component: usize, cx: usize, cy: usize) -> u16 {
        match self.capacity.format.chroma() {
            ChromaLayout::SemiPlanar420 => self.sample(1, cx * 2 + component, cy),
            _ => self.sample(1 + component, cx, cy),
        }
    }

    #[inline]
    pub fn set_chroma(&mut self, component: usize, cx: usize, cy: usize, value: u16) {
        match self.capacity.format.chroma() {
            ChromaLayout::SemiPlanar420 => self.set_sample(1, cx * 2 + component, cy, value),
            _ => self.set_sample(1 + component, cx, cy, value),
        }
    }

    pub fn luma_size(&self) -> (usize, usize) {
        (self.shape.width as usize, self.shape.height as usize)
    }

    pub fn chroma_size(&self) -> (usize, usize) {
        self.shape.chroma_size()
    }

    /// Active bytes of one row.
    pub fn row(&self, plane: usize, y: usize) -> &[u8] {
        let p = &self.planes[plane];
        let width = self.shape.plane_size(plane).0 * self.capacity.format.bytes_per_sample();
        &p.data[y * p.stride..y * p.stride + width]
    }

    pub fn row_mut(&mut self, plane: usize, y: usize) -> &mut [u8] {
        let width = self.shape.plane_size(plane).0 * self.capacity.format.bytes_per_sample();
        let p = &mut self.planes[plane];
        &mut p.data[y * p.stride..y * p.stride + width]
    }

    pub fn fill(&mut self, y: u16, u: u16, v: u16) {
        let (w, h) = self.luma_size();
        for row in 0..h {
            for col in 0..w {
                self.set_sample(0, col, row, y);
            }
        }
        let (cw, ch) = self.chroma_size();
        for row in 0..ch {
            for col in 0..cw {
                self.set_chroma(0, col, row, u);
                self.set_chroma(1, col, row, v);
            }
        }
    }

    /// Copies picture and shape from `other`, which must share this buffer's format.
    pub fn copy_from(&mut self, other: &FrameBuffer) -> Result<()> {
        self.reshape(other.shape)?;
        for plane in 0..self.plane_count() {
            let rows = other.plane_size(plane).1;
            for y in 0..rows {
                self.row_mut(plane, y).copy_from_slice(other.row(plane, y));
            }
        }
        Ok(())
    }

    /// Luma plane scaled to 8 bits, tightly packed.
    pub fn luma_u8(&self) -> Vec<u8> {
        let (w, h) = self.luma_size();
        let shift = self.shape.bit_depth.saturating_sub(8);
        let mut out = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                out.push((self.sample(0, x, y) >> shift).min(255) as u8);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::PixelFormat;

    #[test]
    fn nv12_chroma_is_interleaved() {
        let shape = FrameShape::new(4, 2, PixelFormat::Nv12);
        let mut buffer = FrameBuffer::allocate(shape, MemoryDomain::System).unwrap();
        buffer.set_chroma(0, 1, 0, 40);
        buffer.set_chroma(1, 1, 0, 90);
        assert_eq!(buffer.sample(1, 2, 0), 40);
        assert_eq!(buffer.sample(1, 3, 0), 90);
        assert_eq!(buffer.stride(0) % STRIDE_ALIGN, 0);
    }

    #[test]
    fn wide_samples_round_trip() {
        let shape = FrameShape::new(2, 2, PixelFormat::P010);
        let mut buffer = FrameBuffer::allocate(shape, MemoryDomain::Codec).unwrap();
        buffer.set_sample(0, 1, 1, 1023);
        assert_eq!(buffer.sample(0, 1, 1), 1023);
        assert_eq!(buffer.max_value(), 1023);
    }

    #[test]
    fn reshape_rejects_larger_picture() {
        let shape = FrameShape::new(8, 8, PixelFormat::Yuv420);
        let mut buffer = FrameBuffer::allocate(shape, MemoryDomain::GpuImage).unwrap();
        assert!(buffer.reshape(shape.with_size(4, 4)).is_ok());
        assert!(buffer.reshape(shape.with_size(16, 8)).is_err());
    }
}
