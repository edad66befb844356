//! Region filters: logo removal, picture overlay and burned-in captions.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pool::FrameBufferPool;
use crate::stages::PipelineFrame;
use crate::video::{FrameBuffer, FrameShape, Rational};

use super::{Filter, FilterKind, Rect, clamp_sample, get, put, writable};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelogoParams {
    pub region: Rect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayParams {
    /// PNG drawn at (`x`, `y`). Without one, `region` is filled with `color`.
    pub image: Option<PathBuf>,
    pub x: u32,
    pub y: u32,
    pub region: Rect,
    /// 8-bit limited-range Y, U, V.
    pub color: [u16; 3],
    pub alpha: f32,
}

impl Default for OverlayParams {
    fn default() -> Self {
        Self {
            image: None,
            x: 0,
            y: 0,
            region: Rect::default(),
            color: [235, 128, 128],
            alpha: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleCue {
    /// Seconds.
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubBurnParams {
    /// SubRip file whose cues are appended to `cues`.
    pub file: Option<PathBuf>,
    pub cues: Vec<SubtitleCue>,
}

/// Removes a logo by interpolating the region from its borders.
pub struct DelogoFilter {
    shape: FrameShape,
    region: Rect,
}

impl DelogoFilter {
    pub fn new(input: FrameShape, params: &DelogoParams) -> Result<Self> {
        params.region.check_inside(&input, FilterKind::Delogo)?;
        Ok(Self {
            shape: input,
            region: params.region,
        })
    }
}

fn delogo_channel(buf: &mut FrameBuffer, shape: &FrameShape, region: &Rect, channel: usize) {
    let (rx, ry, rw, rh) = region.on_channel(shape, channel);
    let (cw, ch) = super::channel_size(buf, channel);
    let (x0, x1) = (rx.saturating_sub(1), (rx + rw).min(cw - 1));
    let (y0, y1) = (ry.saturating_sub(1), (ry + rh).min(ch - 1));
    for y in ry..(ry + rh).min(ch) {
        for x in rx..(rx + rw).min(cw) {
            let fx = (x - x0) as f32 / (x1 - x0).max(1) as f32;
            let fy = (y - y0) as f32 / (y1 - y0).max(1) as f32;
            let horizontal =
                get(buf, channel, x0, y) as f32 * (1.0 - fx) + get(buf, channel, x1, y) as f32 * fx;
            let vertical =
                get(buf, channel, x, y0) as f32 * (1.0 - fy) + get(buf, channel, x, y1) as f32 * fy;
            let max = buf.max_value();
            put(buf, channel, x, y, clamp_sample((horizontal + vertical) * 0.5, max));
        }
    }
}

impl Filter for DelogoFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Delogo
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
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let frame = writable(frame, pool, FilterKind::Delogo)?;
        {
            let mut buf = frame.handle.lock();
            let shape = *buf.shape();
            for channel in 0..3 {
                delogo_channel(&mut buf, &shape, &self.region, channel);
            }
        }
        Ok(vec![frame])
    }
}

/// Overlay picture converted to 8-bit YUV with per-sample opacity.
struct Sprite {
    width: usize,
    height: usize,
    // (y, u, v, alpha) per pixel
    pixels: Vec<[f32; 4]>,
}

impl Sprite {
    fn solid(width: usize, height: usize, color: [u16; 3]) -> Self {
        let px = [color[0] as f32, color[1] as f32, color[2] as f32, 1.0];
        Self {
            width,
            height,
            pixels: vec![px; width * height],
        }
    }

    fn load(path: &Path) -> Result<Self> {
        let picture = image::open(path)
            .map_err(|err| {
                PipelineError::InvalidParameter(format!(
                    "overlay image {}: {err}",
                    path.display()
                ))
            })?
            .to_rgba8();
        let (width, height) = (picture.width() as usize, picture.height() as usize);
        let pixels = picture
            .pixels()
            .map(|p| {
                let [r, g, b, a] = p.0.map(|c| c as f32 / 255.0);
                // BT.709 limited range
                let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
                let cb = (b - y) / 1.8556;
                let cr = (r - y) / 1.5748;
                [16.0 + 219.0 * y, 128.0 + 224.0 * cb, 128.0 + 224.0 * cr, a]
            })
            .collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    fn at(&self, x: usize, y: usize) -> [f32; 4] {
        self.pixels[y.min(self.height - 1) * self.width + x.min(self.width - 1)]
    }
}

/// Alpha-blends a picture or a solid box onto every frame.
pub struct OverlayFilter {
    shape: FrameShape,
    sprite: Sprite,
    origin: (usize, usize),
    alpha: f32,
}

impl OverlayFilter {
    pub fn new(input: FrameShape, params: &OverlayParams) -> Result<Self> {
        let (sprite, rect) = match &params.image {
            Some(path) => {
                let sprite = Sprite::load(path)?;
                let rect = Rect {
                    x: params.x,
                    y: params.y,
                    width: sprite.width as u32,
                    height: sprite.height as u32,
                };
                (sprite, rect)
            }
            None => {
                let rect = params.region;
                let sprite = Sprite::solid(rect.width as usize, rect.height as usize, params.color);
                (sprite, rect)
            }
        };
        rect.check_inside(&input, FilterKind::Overlay)?;
        if !(0.0..=1.0).contains(&params.alpha) {
            return Err(PipelineError::InvalidParameter(format!(
                "overlay alpha {} outside 0..1",
                params.alpha
            )));
        }
        Ok(Self {
            shape: input,
            sprite,
            origin: (rect.x as usize, rect.y as usize),
            alpha: params.alpha,
        })
    }

    fn blend(&self, buf: &mut FrameBuffer) {
        let scale = (1u32 << buf.shape().bit_depth.saturating_sub(8)) as f32;
        let max = buf.max_value();
        let (w, h) = buf.luma_size();
        let (ox, oy) = self.origin;
        for y in 0..self.sprite.height.min(h.saturating_sub(oy)) {
            for x in 0..self.sprite.width.min(w.saturating_sub(ox)) {
                let [py, _, _, a] = self.sprite.at(x, y);
                let a = a * self.alpha;
                let dst = buf.sample(0, ox + x, oy + y) as f32;
                buf.set_sample(0, ox + x, oy + y, clamp_sample(dst * (1.0 - a) + py * scale * a, max));
            }
        }
        let (cw, ch) = buf.chroma_size();
        let (sx, sy) = (w.div_ceil(cw).max(1), h.div_ceil(ch).max(1));
        for cy in (oy / sy)..((oy + self.sprite.height).div_ceil(sy)).min(ch) {
            for cx in (ox / sx)..((ox + self.sprite.width).div_ceil(sx)).min(cw) {
                let (lx, ly) = ((cx * sx).saturating_sub(ox), (cy * sy).saturating_sub(oy));
                let [_, pu, pv, a] = self.sprite.at(lx, ly);
                let a = a * self.alpha;
                for (component, value) in [(0, pu), (1, pv)] {
                    let dst = buf.chroma(component, cx, cy) as f32;
                    buf.set_chroma(component, cx, cy, clamp_sample(dst * (1.0 - a) + value * scale * a, max));
                }
            }
        }
    }
}

impl Filter for OverlayFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Overlay
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
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let frame = writable(frame, pool, FilterKind::Overlay)?;
        self.blend(&mut frame.handle.lock());
        Ok(vec![frame])
    }
}

fn parse_srt_time(text: &str) -> Option<f64> {
    let (hms, millis) = text.trim().split_once([',', '.'])?;
    let mut parts = hms.split(':').map(|p| p.parse::<u64>().ok());
    let (h, m, s) = (parts.next()??, parts.next()??, parts.next()??);
    let millis: u64 = millis.parse().ok()?;
    Some((h * 3600 + m * 60 + s) as f64 + millis as f64 / 1000.0)
}

/// Parses SubRip cues.
pub fn parse_srt(content: &str) -> Result<Vec<SubtitleCue>> {
    let mut cues = Vec::new();
    let normalized = content.replace("\r\n", "\n");
    for block in normalized.split("\n\n").filter(|b| !b.trim().is_empty()) {
        let mut lines = block.lines().skip_while(|l| l.trim().is_empty());
        let mut timing = lines.next().unwrap_or_default();
        if !timing.contains("-->") {
            timing = lines.next().unwrap_or_default();
        }
        let (start, end) = timing
            .split_once("-->")
            .and_then(|(a, b)| Some((parse_srt_time(a)?, parse_srt_time(b)?)))
            .ok_or_else(|| {
                PipelineError::InvalidParameter(format!("malformed subtitle timing '{timing}'"))
            })?;
        let text = lines.collect::<Vec<_>>().join("\n");
        cues.push(SubtitleCue { start, end, text });
    }
    Ok(cues)
}

const GLYPH_W: usize = 8;
const GLYPH_H: usize = 16;

/// Burns caption boxes for the active subtitle cue.
///
/// There is no font rasteriser: each visible character becomes a light block inside
/// a dark caption box, one text line per row.
pub struct SubBurnFilter {
    shape: FrameShape,
    cues: Vec<SubtitleCue>,
    timebase: Rational,
}

impl SubBurnFilter {
    pub fn new(input: FrameShape, params: &SubBurnParams, timebase: Rational) -> Result<Self> {
        if !timebase.is_valid() {
            return Err(PipelineError::InvalidParameter(format!(
                "subburn needs a valid timebase, got {timebase}"
            )));
        }
        let mut cues = params.cues.clone();
        if let Some(path) = &params.file {
            let content = fs::read_to_string(path).map_err(|err| {
                PipelineError::InvalidParameter(format!("subtitle file {}: {err}", path.display()))
            })?;
            cues.extend(parse_srt(&content)?);
        }
        cues.sort_by(|a, b| a.start.total_cmp(&b.start));
        Ok(Self {
            shape: input,
            cues,
            timebase,
        })
    }

    fn active_cue(&self, timestamp: i64) -> Option<&SubtitleCue> {
        let seconds = timestamp as f64 * self.timebase.as_f64();
        self.cues
            .iter()
            .find(|cue| seconds >= cue.start && seconds < cue.end)
    }
}

fn fill_luma(buf: &mut FrameBuffer, x0: usize, y0: usize, w: usize, h: usize, value: u16) {
    let (fw, fh) = buf.luma_size();
    for y in y0..(y0 + h).min(fh) {
        for x in x0..(x0 + w).min(fw) {
            buf.set_sample(0, x, y, value);
        }
    }
}

fn draw_caption(buf: &mut FrameBuffer, text: &str) {
    let (w, h) = buf.luma_size();
    let scale = buf.shape().bit_depth.saturating_sub(8);
    let lines: Vec<&str> = text.lines().collect();
    let columns = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    if columns == 0 {
        return;
    }
    let box_w = (columns * GLYPH_W + GLYPH_W).min(w);
    let box_h = (lines.len() * GLYPH_H + GLYPH_H / 2).min(h);
    let x0 = (w - box_w) / 2;
    let y0 = h.saturating_sub(box_h + h / 10);
    fill_luma(buf, x0, y0, box_w, box_h, 16 << scale);
    for (row, line) in lines.iter().enumerate() {
        for (col, c) in line.chars().enumerate() {
            if c.is_whitespace() {
                continue;
            }
            let gx = x0 + GLYPH_W / 2 + col * GLYPH_W + 1;
            let gy = y0 + GLYPH_H / 4 + row * GLYPH_H + 2;
            fill_luma(buf, gx, gy, GLYPH_W - 2, GLYPH_H - 4, 235 << scale);
        }
    }
}

impl Filter for SubBurnFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::SubBurn
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
        pool: &FrameBufferPool,
    ) -> Result<Vec<PipelineFrame>> {
        let Some(frame) = input else {
            return Ok(Vec::new());
        };
        let Some(cue) = self.active_cue(frame.meta.timestamp) else {
            return Ok(vec![frame]);
        };
        let text = cue.text.clone();
        let frame = writable(frame, pool, FilterKind::SubBurn)?;
        draw_caption(&mut frame.handle.lock(), &text);
        Ok(vec![frame])
    }
}
