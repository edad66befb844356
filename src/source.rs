use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::hw::reference::AccessUnitHeader;
use crate::video::{
    BitstreamUnit, Crop, FrameBuffer, FrameMeta, FrameShape, Rational, TrimParam, VideoCodec,
};

/// How far the source's timestamps can be trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampQuality {
    /// Timestamps are synthesized from the frame index.
    #[default]
    None,
    Unreliable,
    Reliable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chapter {
    pub title: String,
    pub start: i64,
}

/// One demultiplexed audio or subtitle packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxPacket {
    pub stream: usize,
    pub pts: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputInfo {
    /// Shape of the pictures the source delivers.
    pub shape: FrameShape,
    /// Compressed stream codec, `None` for raw pictures.
    pub codec: Option<VideoCodec>,
    pub fps: Rational,
    /// Timebase of the source timestamps.
    pub timebase: Option<Rational>,
    pub timestamp_quality: TimestampQuality,
    /// The source already removed the crop from its pictures.
    pub crop_applied: bool,
    pub chapters: Vec<Chapter>,
}

impl InputInfo {
    pub fn raw(shape: FrameShape, fps: Rational) -> Self {
        Self {
            shape,
            codec: None,
            fps,
            timebase: None,
            timestamp_quality: TimestampQuality::None,
            crop_applied: false,
            chapters: Vec::new(),
        }
    }
}

/// Where the pipeline's pictures or access units come from.
pub trait VideoSource: Send {
    fn info(&self) -> &InputInfo;

    /// Reads the next picture into `target`. `Ok(None)` at end of input.
    fn read_frame(&mut self, target: &mut FrameBuffer) -> Result<Option<FrameMeta>> {
        let _ = target;
        Err(PipelineError::UnsupportedOperation(
            "source does not deliver raw pictures".into(),
        ))
    }

    /// Reads the next compressed access unit. `Ok(None)` at end of input.
    fn read_packet(&mut self) -> Result<Option<BitstreamUnit>> {
        Err(PipelineError::UnsupportedOperation(
            "source does not deliver compressed packets".into(),
        ))
    }

    fn trim(&self) -> Option<&TrimParam>;
    fn set_trim(&mut self, trim: TrimParam);

    fn chapters(&self) -> &[Chapter] {
        &self.info().chapters
    }

    /// Audio/subtitle packets demultiplexed since the last call.
    fn take_aux_packets(&mut self) -> Vec<AuxPacket> {
        Vec::new()
    }

    /// Diagnostic description of the input.
    fn message(&self) -> String;
}

pub type SharedSource = Arc<Mutex<Box<dyn VideoSource>>>;

pub fn shared(source: impl VideoSource + 'static) -> SharedSource {
    Arc::new(Mutex::new(Box::new(source)))
}

/// Fills `buf` completely; `Ok(false)` on a clean end of input before the first byte.
fn read_exact_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(PipelineError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("input ended {filled} bytes into a {} byte record", buf.len()),
                )));
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

/// Tightly packed planar pictures, one after another.
pub struct RawFileSource {
    reader: Box<dyn Read + Send>,
    label: String,
    stored: FrameShape,
    crop: Crop,
    info: InputInfo,
    trim: Option<TrimParam>,
    record: Vec<u8>,
    frames: u64,
}

impl RawFileSource {
    pub fn open(path: &Path, stored: FrameShape, fps: Rational, crop: Crop) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(
            Box::new(BufReader::new(file)),
            path.display().to_string(),
            stored,
            fps,
            crop,
        )
    }

    /// `stored` is the picture layout in the stream; the crop is removed while reading.
    pub fn from_reader(
        reader: Box<dyn Read + Send>,
        label: impl Into<String>,
        stored: FrameShape,
        fps: Rational,
        crop: Crop,
    ) -> Result<Self> {
        let (width, height) = crop.apply(stored.width, stored.height).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "crop {}/{}/{}/{} leaves nothing of a {}x{} input",
                crop.left, crop.right, crop.top, crop.bottom, stored.width, stored.height
            ))
        })?;
        let mut info = InputInfo::raw(stored.with_size(width, height), fps);
        info.crop_applied = !crop.is_empty();
        let record_len = (0..stored.format.plane_count())
            .map(|plane| {
                let (w, h) = stored.plane_size(plane);
                w * h * stored.format.bytes_per_sample()
            })
            .sum();
        Ok(Self {
            reader,
            label: label.into(),
            stored,
            crop,
            info,
            trim: None,
            record: vec![0; record_len],
            frames: 0,
        })
    }

    pub fn frame_len(&self) -> usize {
        self.record.len()
    }
}

impl VideoSource for RawFileSource {
    fn info(&self) -> &InputInfo {
        &self.info
    }

    fn read_frame(&mut self, target: &mut FrameBuffer) -> Result<Option<FrameMeta>> {
        if !read_exact_or_eof(self.reader.as_mut(), &mut self.record)? {
            debug!(source = %self.label, frames = self.frames, "Raw input exhausted");
            return Ok(None);
        }
        target.reshape(self.info.shape)?;
        let bps = self.stored.format.bytes_per_sample();
        let (sub_x, sub_y) = subsampling(&self.stored);
        let mut offset = 0;
        for plane in 0..self.stored.format.plane_count() {
            let (w, h) = self.stored.plane_size(plane);
            let (left, top) = if plane == 0 {
                (self.crop.left as usize, self.crop.top as usize)
            } else {
                (self.crop.left as usize / sub_x, self.crop.top as usize / sub_y)
            };
            // Semi-planar chroma rows interleave U and V, so the column offset doubles.
            let column = if plane > 0 && self.stored.format.plane_count() == 2 {
                left * 2
            } else {
                left
            };
            let (out_w, out_h) = self.info.shape.plane_size(plane);
            for y in 0..out_h {
                let start = offset + ((top + y) * w + column) * bps;
                let row = &self.record[start..start + out_w * bps];
                target.row_mut(plane, y).copy_from_slice(row);
            }
            offset += w * h * bps;
        }
        let meta = FrameMeta::new(self.frames as i64, 1, self.frames);
        self.frames += 1;
        Ok(Some(meta))
    }

    fn trim(&self) -> Option<&TrimParam> {
        self.trim.as_ref()
    }

    fn set_trim(&mut self, trim: TrimParam) {
        self.trim = Some(trim);
    }

    fn message(&self) -> String {
        format!("raw {} from {}", self.stored, self.label)
    }
}

fn subsampling(shape: &FrameShape) -> (usize, usize) {
    let (cw, ch) = shape.chroma_size();
    (
        if cw == shape.width as usize { 1 } else { 2 },
        if ch == shape.height as usize { 1 } else { 2 },
    )
}

/// Concatenated raw-codec access units (`.rfv`).
pub struct ElementaryStreamSource {
    reader: Box<dyn Read + Send>,
    label: String,
    info: InputInfo,
    trim: Option<TrimParam>,
    pending: Option<BitstreamUnit>,
    units: u64,
}

impl ElementaryStreamSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(Box::new(BufReader::new(file)), path.display().to_string())
    }

    /// Reads the first access unit to learn the stream layout.
    pub fn from_reader(mut reader: Box<dyn Read + Send>, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let first = read_unit(reader.as_mut())?.ok_or_else(|| {
            PipelineError::Configuration(format!("{label} contains no access units"))
        })?;
        let header = AccessUnitHeader::parse(first.data())?;
        if !header.timebase.is_valid() || header.duration <= 0 {
            return Err(PipelineError::InvalidVideoParam(format!(
                "{label}: first access unit has timebase {} and duration {}",
                header.timebase, header.duration
            )));
        }
        let frame_span = header.timebase.num.checked_mul(header.duration).ok_or_else(|| {
            PipelineError::InvalidVideoParam(format!(
                "{label}: frame duration {} at timebase {} is out of range",
                header.duration, header.timebase
            ))
        })?;
        let fps = Rational::new(header.timebase.den, frame_span).reduce();
        let info = InputInfo {
            shape: header.shape(),
            codec: Some(VideoCodec::Raw),
            fps,
            timebase: Some(header.timebase),
            timestamp_quality: TimestampQuality::Reliable,
            crop_applied: false,
            chapters: Vec::new(),
        };
        Ok(Self {
            reader,
            label,
            info,
            trim: None,
            pending: Some(first),
            units: 0,
        })
    }
}

fn read_unit(reader: &mut dyn Read) -> Result<Option<BitstreamUnit>> {
    let mut head = [0u8; AccessUnitHeader::SIZE];
    if !read_exact_or_eof(reader, &mut head)? {
        return Ok(None);
    }
    let header = AccessUnitHeader::parse(&head)?;
    let mut unit = BitstreamUnit::with_capacity(AccessUnitHeader::SIZE + header.payload_len as usize);
    unit.copy_from(&head);
    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() && !read_exact_or_eof(reader, &mut payload)? {
        return Err(PipelineError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "access unit payload missing",
        )));
    }
    unit.append(&payload);
    unit.pts = header.pts;
    unit.dts = header.pts;
    unit.duration = header.duration;
    unit.frame_type = header.frame_type;
    Ok(Some(unit))
}

impl VideoSource for ElementaryStreamSource {
    fn info(&self) -> &InputInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<BitstreamUnit>> {
        let unit = match self.pending.take() {
            Some(unit) => Some(unit),
            None => read_unit(self.reader.as_mut())?,
        };
        if let Some(mut unit) = unit {
            unit.frame_index = self.units;
            self.units += 1;
            return Ok(Some(unit));
        }
        debug!(source = %self.label, units = self.units, "Elementary stream exhausted");
        Ok(None)
    }

    fn trim(&self) -> Option<&TrimParam> {
        self.trim.as_ref()
    }

    fn set_trim(&mut self, trim: TrimParam) {
        self.trim = Some(trim);
    }

    fn message(&self) -> String {
        format!("raw-codec stream {} from {}", self.info.shape, self.label)
    }
}
