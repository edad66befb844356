//! Software stand-in for a fixed-function video engine.
//!
//! The "raw" codec stores every picture as an intra access unit: a 48 byte
//! little-endian header followed by the planes, each sample right-shifted by a
//! quantizer derived from the QP. Decoding shifts back and adds the midpoint of the
//! dropped range, so QP below 12 is lossless.

use std::collections::VecDeque;

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::source::InputInfo;
use crate::video::{
    BitstreamUnit, FrameBuffer, FrameMeta, FrameShape, FrameType, PicStruct, PixelFormat, Rational,
    VideoCodec,
};

use super::{CodecConfig, HwDecoder, HwDevice, HwEncoder, PrepConfig, RateControlConfig, RateControlMode};

const MAGIC: &[u8; 4] = b"RFAU";
const VERSION: u8 = 1;

fn format_code(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Nv12 => 0,
        PixelFormat::P010 => 1,
        PixelFormat::Yuv420 => 2,
        PixelFormat::Yuv420P16 => 3,
        PixelFormat::Yuv444 => 4,
        PixelFormat::Yuv444P16 => 5,
    }
}

fn format_from_code(code: u8) -> Option<PixelFormat> {
    Some(match code {
        0 => PixelFormat::Nv12,
        1 => PixelFormat::P010,
        2 => PixelFormat::Yuv420,
        3 => PixelFormat::Yuv420P16,
        4 => PixelFormat::Yuv444,
        5 => PixelFormat::Yuv444P16,
        _ => return None,
    })
}

fn pic_struct_code(pic_struct: PicStruct) -> u8 {
    match pic_struct {
        PicStruct::Progressive => 0,
        PicStruct::Tff => 1,
        PicStruct::Bff => 2,
        PicStruct::Interlaced => 3,
    }
}

fn pic_struct_from_code(code: u8) -> Option<PicStruct> {
    Some(match code {
        0 => PicStruct::Progressive,
        1 => PicStruct::Tff,
        2 => PicStruct::Bff,
        3 => PicStruct::Interlaced,
        _ => return None,
    })
}

fn corrupt(message: impl Into<String>) -> PipelineError {
    PipelineError::stage("rfv", message)
}

/// Fixed-size prefix of every raw access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessUnitHeader {
    pub format: PixelFormat,
    pub bit_depth: u8,
    pub frame_type: FrameType,
    pub pic_struct: PicStruct,
    pub qshift: u8,
    pub width: u32,
    pub height: u32,
    pub timebase: Rational,
    pub pts: i64,
    pub duration: i64,
    pub payload_len: u32,
}

impl AccessUnitHeader {
    pub const SIZE: usize = 48;

    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.width, self.height, self.format)
            .with_format(self.format, self.bit_depth)
            .with_pic_struct(self.pic_struct)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(format_code(self.format));
        out.push(self.bit_depth);
        out.push(self.frame_type.code());
        out.push(pic_struct_code(self.pic_struct));
        out.push(self.qshift);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&(self.timebase.num as u32).to_le_bytes());
        out.extend_from_slice(&(self.timebase.den as u32).to_le_bytes());
        out.extend_from_slice(&self.pts.to_le_bytes());
        out.extend_from_slice(&self.duration.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(corrupt(format!(
                "access unit header needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(corrupt("access unit does not start with RFAU"));
        }
        if bytes[4] != VERSION {
            return Err(corrupt(format!("unsupported access unit version {}", bytes[4])));
        }
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let i64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            i64::from_le_bytes(raw)
        };
        let format = format_from_code(bytes[5])
            .ok_or_else(|| corrupt(format!("unknown pixel format code {}", bytes[5])))?;
        let frame_type = FrameType::from_code(bytes[7])
            .ok_or_else(|| corrupt(format!("unknown frame type code {}", bytes[7])))?;
        let pic_struct = pic_struct_from_code(bytes[8])
            .ok_or_else(|| corrupt(format!("unknown picture structure code {}", bytes[8])))?;
        let header = Self {
            format,
            bit_depth: bytes[6],
            frame_type,
            pic_struct,
            qshift: bytes[9],
            width: u32_at(12),
            height: u32_at(16),
            timebase: Rational::new(u32_at(20) as i64, u32_at(24) as i64),
            pts: i64_at(28),
            duration: i64_at(36),
            payload_len: u32_at(44),
        };
        if header.bit_depth == 0 || header.bit_depth > 16 || header.qshift >= header.bit_depth {
            return Err(corrupt(format!(
                "bit depth {} with quantizer shift {} is invalid",
                header.bit_depth, header.qshift
            )));
        }
        if header.width == 0 || header.height == 0 {
            return Err(corrupt("access unit declares an empty picture"));
        }
        Ok(header)
    }

    fn wide_payload(&self) -> bool {
        self.bit_depth - self.qshift > 8
    }

    /// Payload bytes a picture of this header occupies.
    pub fn expected_payload(&self) -> usize {
        let shape = self.shape();
        let per_sample = if self.wide_payload() { 2 } else { 1 };
        (0..self.format.plane_count())
            .map(|plane| {
                let (w, h) = shape.plane_size(plane);
                w * h * per_sample
            })
            .sum()
    }
}

/// Encodes `frame` as one raw access unit.
fn encode_picture(
    frame: &FrameBuffer,
    meta: &FrameMeta,
    frame_type: FrameType,
    qshift: u8,
    timebase: Rational,
) -> Vec<u8> {
    let shape = *frame.shape();
    let mut header = AccessUnitHeader {
        format: shape.format,
        bit_depth: shape.bit_depth,
        frame_type,
        pic_struct: meta.pic_struct,
        qshift,
        width: shape.width,
        height: shape.height,
        timebase,
        pts: meta.timestamp,
        duration: meta.duration,
        payload_len: 0,
    };
    let payload_len = header.expected_payload();
    header.payload_len = payload_len as u32;
    let mut out = Vec::with_capacity(AccessUnitHeader::SIZE + payload_len);
    header.write(&mut out);
    let wide = header.wide_payload();
    for plane in 0..shape.format.plane_count() {
        let (w, h) = shape.plane_size(plane);
        for y in 0..h {
            for x in 0..w {
                let q = frame.sample(plane, x, y) >> qshift;
                if wide {
                    out.extend_from_slice(&q.to_le_bytes());
                } else {
                    out.push(q as u8);
                }
            }
        }
    }
    out
}

/// Reconstructs the picture in `data` into `target`.
pub fn decode_picture(data: &[u8], target: &mut FrameBuffer) -> Result<AccessUnitHeader> {
    let header = AccessUnitHeader::parse(data)?;
    let payload = &data[AccessUnitHeader::SIZE..];
    let expected = header.expected_payload();
    if header.payload_len as usize != expected || payload.len() < expected {
        return Err(corrupt(format!(
            "payload of {} bytes does not match a {} picture ({expected} bytes)",
            payload.len(),
            header.shape()
        )));
    }
    target.reshape(header.shape())?;
    let wide = header.wide_payload();
    let max = header.shape().max_sample() as u32;
    let bias = if header.qshift > 0 { 1u32 << (header.qshift - 1) } else { 0 };
    let mut pos = 0;
    for plane in 0..header.format.plane_count() {
        let (w, h) = header.shape().plane_size(plane);
        for y in 0..h {
            for x in 0..w {
                let q = if wide {
                    let v = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
                    pos += 2;
                    v
                } else {
                    let v = payload[pos] as u16;
                    pos += 1;
                    v
                };
                let value = (((q as u32) << header.qshift) | bias).min(max);
                target.set_sample(plane, x, y, value as u16);
            }
        }
    }
    Ok(header)
}

/// Device with the raw codec and optional compute queue and scaler.
#[derive(Debug, Clone)]
pub struct ReferenceDevice {
    compute: bool,
    scaler: bool,
    encoder_delay: usize,
}

impl Default for ReferenceDevice {
    fn default() -> Self {
        Self {
            compute: true,
            scaler: true,
            encoder_delay: 2,
        }
    }
}

impl ReferenceDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compute(mut self, available: bool) -> Self {
        self.compute = available;
        self
    }

    pub fn with_scaler(mut self, available: bool) -> Self {
        self.scaler = available;
        self
    }

    /// Pictures the encoder buffers before it returns the first unit.
    pub fn with_encoder_delay(mut self, delay: usize) -> Self {
        self.encoder_delay = delay;
        self
    }
}

impl HwDevice for ReferenceDevice {
    fn name(&self) -> &str {
        "reference"
    }

    fn supports_decode(&self, codec: VideoCodec) -> bool {
        codec == VideoCodec::Raw
    }

    fn supports_encode(&self, codec: VideoCodec) -> bool {
        codec == VideoCodec::Raw
    }

    fn compute_available(&self) -> bool {
        self.compute
    }

    fn fixed_function_scaler(&self) -> bool {
        self.scaler
    }

    fn open_decoder(&self, codec: VideoCodec, info: &InputInfo) -> Result<Box<dyn HwDecoder>> {
        if !self.supports_decode(codec) {
            return Err(PipelineError::UnsupportedCodec {
                codec,
                component: "decoder",
            });
        }
        Ok(Box::new(ReferenceDecoder {
            shape: info.shape,
            queue: VecDeque::new(),
            decoded: 0,
        }))
    }

    fn open_encoder(&self, codec: VideoCodec) -> Result<Box<dyn HwEncoder>> {
        if !self.supports_encode(codec) {
            return Err(PipelineError::UnsupportedCodec {
                codec,
                component: "encoder",
            });
        }
        Ok(Box::new(ReferenceEncoder {
            prep: None,
            qp: 0,
            gop: 0,
            delay: self.encoder_delay,
            delayed: VecDeque::new(),
            ready: VecDeque::new(),
            submitted: 0,
        }))
    }
}

struct ReferenceDecoder {
    shape: FrameShape,
    queue: VecDeque<BitstreamUnit>,
    decoded: u64,
}

impl HwDecoder for ReferenceDecoder {
    fn codec(&self) -> VideoCodec {
        VideoCodec::Raw
    }

    fn output_shape(&self) -> FrameShape {
        self.shape
    }

    fn surface_slack(&self) -> usize {
        1
    }

    fn submit(&mut self, unit: Option<&BitstreamUnit>) -> Result<()> {
        if let Some(unit) = unit {
            self.queue.push_back(unit.clone());
        }
        Ok(())
    }

    fn receive(&mut self, target: &mut FrameBuffer) -> Result<Option<FrameMeta>> {
        let Some(mut unit) = self.queue.pop_front() else {
            return Ok(None);
        };
        let header = decode_picture(unit.data(), target)?;
        let mut meta = FrameMeta::new(header.pts, header.duration, self.decoded);
        meta.pic_struct = header.pic_struct;
        meta.side_data = unit.take_side_data();
        self.decoded += 1;
        Ok(Some(meta))
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

struct ReferenceEncoder {
    prep: Option<PrepConfig>,
    qp: u32,
    gop: u32,
    delay: usize,
    delayed: VecDeque<BitstreamUnit>,
    ready: VecDeque<BitstreamUnit>,
    submitted: u64,
}

impl ReferenceEncoder {
    fn qshift(&self, bit_depth: u8) -> u8 {
        ((self.qp / 12) as u8).min(4).min(bit_depth.saturating_sub(1))
    }

    fn frame_type(&self) -> FrameType {
        let idr = match self.gop {
            0 => self.submitted == 0,
            gop => self.submitted % gop as u64 == 0,
        };
        if idr { FrameType::Idr } else { FrameType::P }
    }
}

impl HwEncoder for ReferenceEncoder {
    fn codec(&self) -> VideoCodec {
        VideoCodec::Raw
    }

    fn apply_prep(&mut self, prep: &PrepConfig) -> Result<()> {
        if prep.rotation != 0 {
            return Err(PipelineError::UnsupportedOperation(format!(
                "reference encoder cannot rotate by {} degrees",
                prep.rotation
            )));
        }
        self.prep = Some(*prep);
        Ok(())
    }

    fn apply_rate_control(&mut self, rc: &RateControlConfig) -> Result<()> {
        self.qp = match rc.mode {
            RateControlMode::Cqp => rc.qp_init.max(0) as u32,
            _ => (rc.qp_min + rc.qp_max) / 2,
        };
        self.gop = rc.gop;
        debug!(qp = self.qp, gop = self.gop, mode = ?rc.mode, "Reference encoder rate control applied");
        Ok(())
    }

    fn apply_codec(&mut self, codec: &CodecConfig) -> Result<()> {
        match codec {
            CodecConfig::Raw => Ok(()),
            CodecConfig::H264 { .. } => Err(PipelineError::UnsupportedCodec {
                codec: VideoCodec::H264,
                component: "encoder",
            }),
            CodecConfig::Hevc { .. } => Err(PipelineError::UnsupportedCodec {
                codec: VideoCodec::Hevc,
                component: "encoder",
            }),
        }
    }

    fn input_slack(&self) -> usize {
        self.delay + 1
    }

    fn submit(&mut self, frame: Option<(&FrameBuffer, &FrameMeta)>) -> Result<()> {
        let Some((buffer, meta)) = frame else {
            self.ready.extend(self.delayed.drain(..));
            return Ok(());
        };
        let prep = self.prep.ok_or_else(|| {
            PipelineError::InvalidOperation("encoder used before its picture configuration".into())
        })?;
        let shape = buffer.shape();
        if shape.format != prep.format || shape.width != prep.width || shape.height != prep.height {
            return Err(PipelineError::stage(
                "reference-encoder",
                format!("got a {shape} picture, configured for {}", prep.shape()),
            ));
        }
        let frame_type = self.frame_type();
        let qshift = self.qshift(shape.bit_depth);
        let bytes = encode_picture(buffer, meta, frame_type, qshift, prep.timebase);
        let mut unit = BitstreamUnit::from_slice(&bytes, meta.timestamp, meta.timestamp);
        unit.duration = meta.duration;
        unit.frame_type = frame_type;
        unit.avg_qp = self.qp;
        unit.frame_index = meta.input_frame_id;
        for item in &meta.side_data {
            unit.add_side_data(item.clone());
        }
        self.submitted += 1;
        self.delayed.push_back(unit);
        while self.delayed.len() > self.delay {
            if let Some(unit) = self.delayed.pop_front() {
                self.ready.push_back(unit);
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<BitstreamUnit>> {
        Ok(self.ready.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::RateControlConfig;
    use crate::job::EncoderParams;
    use crate::video::MemoryDomain;

    fn encoder(qp: u32, delay: usize, shape: FrameShape) -> Box<dyn HwEncoder> {
        let device = ReferenceDevice::new().with_encoder_delay(delay);
        let mut encoder = device.open_encoder(VideoCodec::Raw).unwrap();
        let params = EncoderParams {
            codec: Some(VideoCodec::Raw),
            qp,
            gop: 3,
            ..EncoderParams::default()
        };
        encoder
            .apply_prep(&PrepConfig::new(shape, 0, Rational::new(1, 30)).unwrap())
            .unwrap();
        encoder
            .apply_rate_control(&RateControlConfig::from_params(&params, Rational::new(30, 1)))
            .unwrap();
        encoder.apply_codec(&CodecConfig::Raw).unwrap();
        encoder
    }

    fn gradient(shape: FrameShape) -> FrameBuffer {
        let mut frame = FrameBuffer::allocate(shape, MemoryDomain::Codec).unwrap();
        frame.fill(0, 100, 160);
        let (w, h) = frame.luma_size();
        for y in 0..h {
            for x in 0..w {
                frame.set_sample(0, x, y, (x * 7 + y * 3) as u16 % 256);
            }
        }
        frame
    }

    #[test]
    fn low_qp_round_trips_exactly() {
        let shape = FrameShape::new(8, 4, PixelFormat::Nv12);
        let source = gradient(shape);
        let mut enc = encoder(0, 0, shape);
        enc.submit(Some((&source, &FrameMeta::new(5, 1, 0)))).unwrap();
        let unit = enc.receive().unwrap().unwrap();
        assert_eq!(unit.frame_type, FrameType::Idr);

        let mut decoded = FrameBuffer::allocate(shape, MemoryDomain::System).unwrap();
        let header = decode_picture(unit.data(), &mut decoded).unwrap();
        assert_eq!(header.pts, 5);
        for y in 0..4 {
            for x in 0..8 {
                assert_eq!(decoded.sample(0, x, y), source.sample(0, x, y));
            }
        }
        assert_eq!(decoded.chroma(1, 2, 1), 160);
    }

    #[test]
    fn quantizer_error_is_bounded_by_half_step() {
        let shape = FrameShape::new(8, 4, PixelFormat::Yuv420);
        let source = gradient(shape);
        let mut enc = encoder(30, 0, shape);
        enc.submit(Some((&source, &FrameMeta::default()))).unwrap();
        let unit = enc.receive().unwrap().unwrap();
        let mut decoded = FrameBuffer::allocate(shape, MemoryDomain::System).unwrap();
        let header = decode_picture(unit.data(), &mut decoded).unwrap();
        assert_eq!(header.qshift, 2);
        for y in 0..4 {
            for x in 0..8 {
                let diff = decoded.sample(0, x, y) as i32 - source.sample(0, x, y) as i32;
                assert!(diff.abs() <= 2, "diff {diff} at {x},{y}");
            }
        }
    }

    #[test]
    fn encoder_delay_holds_units_until_drained() {
        let shape = FrameShape::new(4, 4, PixelFormat::Nv12);
        let source = gradient(shape);
        let mut enc = encoder(0, 2, shape);
        assert_eq!(enc.input_slack(), 3);
        for index in 0..3u64 {
            let meta = FrameMeta::new(index as i64, 1, index);
            enc.submit(Some((&source, &meta))).unwrap();
        }
        let first = enc.receive().unwrap().unwrap();
        assert_eq!(first.frame_index, 0);
        assert!(enc.receive().unwrap().is_none());
        enc.submit(None).unwrap();
        let rest: Vec<_> = std::iter::from_fn(|| enc.receive().unwrap()).collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].frame_type, FrameType::P);
    }

    #[test]
    fn mismatched_picture_is_a_stage_failure() {
        let shape = FrameShape::new(4, 4, PixelFormat::Nv12);
        let mut enc = encoder(0, 0, shape);
        let other = gradient(FrameShape::new(8, 4, PixelFormat::Nv12));
        assert!(matches!(
            enc.submit(Some((&other, &FrameMeta::default()))),
            Err(PipelineError::StageFailure { .. })
        ));
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = vec![0u8; AccessUnitHeader::SIZE];
        bytes[..4].copy_from_slice(b"NOPE");
        assert!(AccessUnitHeader::parse(&bytes).is_err());
    }
}
