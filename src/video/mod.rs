use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub mod bitstream;
pub mod frame;

pub use bitstream::BitstreamUnit;
pub use frame::FrameBuffer;

/// Pixel layouts understood by the pipeline. Samples are stored LSB-aligned; formats
/// with a `P16`/`P010` storage use two little-endian bytes per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Nv12,
    P010,
    Yuv420,
    Yuv420P16,
    Yuv444,
    Yuv444P16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaLayout {
    SemiPlanar420,
    Planar420,
    Planar444,
}

impl PixelFormat {
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Nv12 => "nv12",
            PixelFormat::P010 => "p010",
            PixelFormat::Yuv420 => "yuv420",
            PixelFormat::Yuv420P16 => "yuv420p16",
            PixelFormat::Yuv444 => "yuv444",
            PixelFormat::Yuv444P16 => "yuv444p16",
        }
    }

    pub fn chroma(self) -> ChromaLayout {
        match self {
            PixelFormat::Nv12 | PixelFormat::P010 => ChromaLayout::SemiPlanar420,
            PixelFormat::Yuv420 | PixelFormat::Yuv420P16 => ChromaLayout::Planar420,
            PixelFormat::Yuv444 | PixelFormat::Yuv444P16 => ChromaLayout::Planar444,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        if self.is_wide() { 2 } else { 1 }
    }

    /// Two-byte sample storage.
    pub fn is_wide(self) -> bool {
        matches!(
            self,
            PixelFormat::P010 | PixelFormat::Yuv420P16 | PixelFormat::Yuv444P16
        )
    }

    pub fn default_bit_depth(self) -> u8 {
        match self {
            PixelFormat::P010 => 10,
            PixelFormat::Yuv420P16 | PixelFormat::Yuv444P16 => 16,
            _ => 8,
        }
    }

    pub fn plane_count(self) -> usize {
        match self.chroma() {
            ChromaLayout::SemiPlanar420 => 2,
            _ => 3,
        }
    }

    /// Format compute filters operate on when fed a frame of this format.
    pub fn compute_format(self) -> PixelFormat {
        match self {
            PixelFormat::Nv12 => PixelFormat::Yuv420,
            PixelFormat::P010 => PixelFormat::Yuv420P16,
            other => other,
        }
    }

    /// Whether compute filters can consume this format without an entry conversion.
    pub fn is_compute_native(self) -> bool {
        self.compute_format() == self
    }

    /// Same chroma layout, storage chosen for `bit_depth`.
    pub fn with_depth(self, bit_depth: u8) -> PixelFormat {
        let wide = bit_depth > 8;
        match (self.chroma(), wide) {
            (ChromaLayout::SemiPlanar420, false) => PixelFormat::Nv12,
            (ChromaLayout::SemiPlanar420, true) => PixelFormat::P010,
            (ChromaLayout::Planar420, false) => PixelFormat::Yuv420,
            (ChromaLayout::Planar420, true) => PixelFormat::Yuv420P16,
            (ChromaLayout::Planar444, false) => PixelFormat::Yuv444,
            (ChromaLayout::Planar444, true) => PixelFormat::Yuv444P16,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryDomain {
    System,
    GpuImage,
    Codec,
}

impl fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryDomain::System => "system",
            MemoryDomain::GpuImage => "gpu-image",
            MemoryDomain::Codec => "codec",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PicStruct {
    #[default]
    Progressive,
    Tff,
    Bff,
    /// Interlaced content without a declared field order.
    Interlaced,
}

impl PicStruct {
    pub fn is_interlaced(self) -> bool {
        !matches!(self, PicStruct::Progressive)
    }

    pub fn has_field_order(self) -> bool {
        matches!(self, PicStruct::Tff | PicStruct::Bff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bit_depth: u8,
    #[serde(default)]
    pub pic_struct: PicStruct,
}

impl FrameShape {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            bit_depth: format.default_bit_depth(),
            pic_struct: PicStruct::Progressive,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_format(mut self, format: PixelFormat, bit_depth: u8) -> Self {
        self.format = format;
        self.bit_depth = bit_depth;
        self
    }

    pub fn with_pic_struct(mut self, pic_struct: PicStruct) -> Self {
        self.pic_struct = pic_struct;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn chroma_size(&self) -> (usize, usize) {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.format.chroma() {
            ChromaLayout::Planar444 => (w, h),
            _ => (w.div_ceil(2), h.div_ceil(2)),
        }
    }

    /// Samples per row and row count of `plane`.
    pub fn plane_size(&self, plane: usize) -> (usize, usize) {
        if plane == 0 {
            return (self.width as usize, self.height as usize);
        }
        let (cw, ch) = self.chroma_size();
        match self.format.chroma() {
            ChromaLayout::SemiPlanar420 => (cw * 2, ch),
            _ => (cw, ch),
        }
    }

    pub fn max_sample(&self) -> u16 {
        ((1u32 << self.bit_depth.clamp(1, 16)) - 1) as u16
    }

    /// Whether a buffer allocated for `self` can hold a picture of `other`.
    pub fn can_hold(&self, other: &FrameShape) -> bool {
        self.format == other.format && other.width <= self.width && other.height <= self.height
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} {}-bit",
            self.width, self.height, self.format, self.bit_depth
        )?;
        if self.pic_struct.is_interlaced() {
            write!(f, " {:?}", self.pic_struct)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RationalRepr", into = "String")]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn reduce(self) -> Self {
        let g = gcd(self.num.unsigned_abs(), self.den.unsigned_abs()).max(1) as i64;
        Self::new(self.num / g, self.den / g)
    }

    pub fn inv(self) -> Self {
        Self::new(self.den, self.num)
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Converts `value` expressed in `from` ticks into `to` ticks, rounding to nearest.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let numer = value as i128 * from.num as i128 * to.den as i128;
    let denom = from.den as i128 * to.num as i128;
    if denom == 0 {
        return 0;
    }
    let half = denom.abs() / 2;
    let rounded = if (numer >= 0) == (denom > 0) {
        (numer.abs() + half) / denom.abs()
    } else {
        -((numer.abs() + half) / denom.abs())
    };
    rounded as i64
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Rational {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (num, den) = match s.split_once(['/', ':']) {
            Some((n, d)) => (n.trim(), d.trim()),
            None => (s, "1"),
        };
        let num = num
            .parse::<i64>()
            .map_err(|err| format!("invalid rational '{s}': {err}"))?;
        let den = den
            .parse::<i64>()
            .map_err(|err| format!("invalid rational '{s}': {err}"))?;
        Ok(Rational::new(num, den))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RationalRepr {
    Int(i64),
    Text(String),
}

impl TryFrom<RationalRepr> for Rational {
    type Error = String;

    fn try_from(value: RationalRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            RationalRepr::Int(n) => Ok(Rational::new(n, 1)),
            RationalRepr::Text(text) => text.parse(),
        }
    }
}

impl From<Rational> for String {
    fn from(value: Rational) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// Uncompressed intra access units produced by the reference device.
    Raw,
    #[default]
    H264,
    Hevc,
    Av1,
    Vp9,
    Mpeg2,
}

impl VideoCodec {
    /// Upper bound for quantizer values at the given output depth.
    pub fn max_qp(self, bit_depth: u8) -> u32 {
        match self {
            VideoCodec::Av1 => 255,
            _ if bit_depth > 8 => 63,
            _ => 51,
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoCodec::Raw => "raw",
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
            VideoCodec::Av1 => "av1",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Mpeg2 => "mpeg2",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Idr,
    I,
    P,
    B,
}

impl FrameType {
    pub fn code(self) -> u8 {
        match self {
            FrameType::Idr => 0,
            FrameType::I => 1,
            FrameType::P => 2,
            FrameType::B => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FrameType::Idr),
            1 => Some(FrameType::I),
            2 => Some(FrameType::P),
            3 => Some(FrameType::B),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SideDataKind {
    Hdr10Plus,
    DolbyVisionRpu,
    UserData,
}

/// Opaque per-frame metadata carried from input to bitstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSideData {
    pub kind: SideDataKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub timestamp: i64,
    pub duration: i64,
    pub input_frame_id: u64,
    pub pic_struct: PicStruct,
    pub side_data: Vec<FrameSideData>,
}

impl FrameMeta {
    pub fn new(timestamp: i64, duration: i64, input_frame_id: u64) -> Self {
        Self {
            timestamp,
            duration,
            input_frame_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Crop {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl Crop {
    pub fn is_empty(&self) -> bool {
        self.left == 0 && self.right == 0 && self.top == 0 && self.bottom == 0
    }

    /// Picture size left after cropping, or `None` if nothing remains.
    pub fn apply(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let w = width.checked_sub(self.left)?.checked_sub(self.right)?;
        let h = height.checked_sub(self.top)?.checked_sub(self.bottom)?;
        (w > 0 && h > 0).then_some((w, h))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimRange {
    pub start: u64,
    pub end: u64,
}

impl TrimRange {
    pub fn contains(&self, index: u64) -> bool {
        (self.start..=self.end).contains(&index)
    }
}

/// Input frame ranges to keep, in input-frame numbering shifted by `offset`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimParam {
    pub ranges: Vec<TrimRange>,
    #[serde(default)]
    pub offset: u64,
}

impl TrimParam {
    pub fn new(ranges: Vec<TrimRange>, offset: u64) -> Result<Self> {
        let param = Self { ranges, offset };
        param.check()?;
        Ok(param)
    }

    pub fn check(&self) -> Result<()> {
        let mut previous_end: Option<u64> = None;
        for range in &self.ranges {
            if range.end < range.start {
                return Err(PipelineError::Configuration(format!(
                    "trim range {}-{} ends before it starts",
                    range.start, range.end
                )));
            }
            if range.end.checked_add(self.offset).is_none() {
                return Err(PipelineError::Configuration(format!(
                    "trim range {}-{} with offset {} is past the last frame position",
                    range.start, range.end, self.offset
                )));
            }
            if let Some(prev) = previous_end
                && range.start <= prev
            {
                return Err(PipelineError::Configuration(format!(
                    "trim range {}-{} overlaps or precedes the previous range",
                    range.start, range.end
                )));
            }
            previous_end = Some(range.end);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether the frame at input position `index` falls inside a kept range.
    pub fn keeps(&self, index: u64) -> bool {
        let Some(shifted) = index.checked_sub(self.offset) else {
            return false;
        };
        self.ranges.iter().any(|range| range.contains(shifted))
    }

    /// Last input position any range keeps, if bounded.
    pub fn last_kept(&self) -> Option<u64> {
        self.ranges
            .last()
            .and_then(|range| range.end.checked_add(self.offset))
    }
}
