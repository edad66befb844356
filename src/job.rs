use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::filters::adjust::{ColorspaceParams, CurvesParams, TweakParams};
use crate::filters::decimate::{DecimateParams, MpDecimateParams};
use crate::filters::deinterlace::{AfsParams, NnediParams, YadifParams};
use crate::filters::denoise::{
    Convolution3dParams, DebandParams, KnnParams, PmdParams, SmoothParams,
};
use crate::filters::overlay::{DelogoParams, OverlayParams, SubBurnParams};
use crate::filters::pad::PadParams;
use crate::filters::sharpen::{EdgeLevelParams, UnsharpParams, WarpSharpParams};
use crate::filters::transform::TransformParams;
use crate::filters::{FilterKind, ResizeAlgorithm, ResizeEngine};
use crate::hw::RateControlMode;
use crate::quality::QualityGateSpec;
use crate::scheduler::ComputePolicy;
use crate::stages::AvSyncMode;
use crate::video::{Crop, FrameShape, PicStruct, PixelFormat, Rational, TrimParam, VideoCodec};

/// A transcode job file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscodeJob {
    pub version: u32,
    pub inputs: Vec<InputPattern>,
    pub output: OutputSpec,
    #[serde(default)]
    pub input: InputParams,
    /// Without an encoder the pipeline writes raw pictures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder: Option<EncoderParams>,
    #[serde(default)]
    pub filters: VppParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<TrimParam>,
    #[serde(default)]
    pub sync: SyncParams,
    #[serde(default)]
    pub metric: MetricParams,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quality_gates: Vec<QualityGateSpec>,
    #[serde(default)]
    pub control: ControlParams,
    /// Auxiliary stream index to output path template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aux_outputs: BTreeMap<usize, String>,
}

impl TranscodeJob {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse job YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn expand_inputs(&self) -> Result<Vec<PathBuf>> {
        let mut resolved = Vec::new();
        for input in &self.inputs {
            let matches = glob(&input.path)
                .with_context(|| format!("Invalid glob pattern: {}", input.path))?;
            let mut found = false;
            for entry in matches {
                let path = entry?;
                if path.is_file() {
                    resolved.push(path);
                    found = true;
                }
            }
            if !found {
                anyhow::bail!("No inputs matched pattern: {}", input.path);
            }
        }
        Ok(resolved)
    }

    /// Output file for `input`, following `output.structure`.
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let ext = match &self.encoder {
            Some(_) => "rfv",
            None => "yuv",
        };
        self.output.render(input, ext)
    }

    /// Auxiliary stream outputs for `input`, keyed by stream index.
    pub fn aux_paths(&self, input: &Path) -> BTreeMap<usize, PathBuf> {
        self.aux_outputs
            .iter()
            .map(|(stream, template)| {
                let spec = OutputSpec {
                    directory: self.output.directory.clone(),
                    structure: template.clone(),
                };
                (*stream, spec.render(input, "bin"))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputPattern {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSpec {
    pub directory: PathBuf,
    #[serde(default = "default_output_structure")]
    pub structure: String,
}

fn default_output_structure() -> String {
    "{stem}.{ext}".to_string()
}

impl OutputSpec {
    pub fn render(&self, input: &Path, ext: &str) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let name = self.structure.replace("{stem}", &stem).replace("{ext}", ext);
        self.directory.join(name)
    }
}

/// How input files are read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputContainer {
    /// `.rfv` files are elementary streams, everything else raw pictures.
    #[default]
    Auto,
    Raw,
    Rfv,
}

impl InputContainer {
    pub fn resolve(self, path: &Path) -> InputContainer {
        match self {
            InputContainer::Auto => {
                let is_stream = path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("rfv"));
                if is_stream {
                    InputContainer::Rfv
                } else {
                    InputContainer::Raw
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InputParams {
    pub container: InputContainer,
    /// Stored raw picture size.
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bit_depth: Option<u8>,
    pub pic_struct: PicStruct,
    pub fps: Rational,
    pub crop: Crop,
}

impl Default for InputParams {
    fn default() -> Self {
        Self {
            container: InputContainer::Auto,
            width: 0,
            height: 0,
            format: PixelFormat::Nv12,
            bit_depth: None,
            pic_struct: PicStruct::Progressive,
            fps: Rational::new(30, 1),
            crop: Crop::default(),
        }
    }
}

impl InputParams {
    /// Layout of raw pictures in the input file, before cropping.
    pub fn stored_shape(&self) -> FrameShape {
        let depth = self.bit_depth.unwrap_or_else(|| self.format.default_bit_depth());
        FrameShape::new(self.width, self.height, self.format)
            .with_format(self.format, depth)
            .with_pic_struct(self.pic_struct)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncoderParams {
    /// Defaults to H.264.
    pub codec: Option<VideoCodec>,
    pub rate_control: RateControlMode,
    /// kbps.
    pub bitrate: u32,
    pub max_bitrate: u32,
    pub qp: u32,
    pub qp_min: u32,
    pub qp_max: u32,
    pub gop: u32,
    pub profile: Option<String>,
    pub level: Option<String>,
    pub tier: Option<String>,
    pub rotation: u16,
    /// Output bit depth; defaults to the source depth.
    pub output_depth: Option<u8>,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            codec: None,
            rate_control: RateControlMode::Cqp,
            bitrate: 5000,
            max_bitrate: 10000,
            qp: 24,
            qp_min: 0,
            qp_max: 51,
            gop: 0,
            profile: None,
            level: None,
            tier: None,
            rotation: 0,
            output_depth: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ResizeParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub algorithm: ResizeAlgorithm,
    pub engine: ResizeEngine,
}

impl ResizeParams {
    pub fn target(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some((width, height)),
            _ => None,
        }
    }
}

/// Optional filters. A present section enables the filter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct VppParams {
    pub colorspace: Option<ColorspaceParams>,
    pub delogo: Option<DelogoParams>,
    pub afs: Option<AfsParams>,
    pub nnedi: Option<NnediParams>,
    pub yadif: Option<YadifParams>,
    pub decimate: Option<DecimateParams>,
    pub mpdecimate: Option<MpDecimateParams>,
    pub convolution3d: Option<Convolution3dParams>,
    pub smooth: Option<SmoothParams>,
    pub knn: Option<KnnParams>,
    pub pmd: Option<PmdParams>,
    pub subburn: Option<SubBurnParams>,
    pub resize: ResizeParams,
    pub unsharp: Option<UnsharpParams>,
    pub edgelevel: Option<EdgeLevelParams>,
    pub warpsharp: Option<WarpSharpParams>,
    pub transform: Option<TransformParams>,
    pub curves: Option<CurvesParams>,
    pub tweak: Option<TweakParams>,
    pub deband: Option<DebandParams>,
    pub pad: Option<PadParams>,
    pub overlay: Option<OverlayParams>,
}

impl VppParams {
    /// Configured filters in application order. Convert and resize are decided by
    /// the pipeline builder and never appear here.
    pub fn enabled(&self) -> Vec<FilterKind> {
        FilterKind::ORDERED
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }

    pub fn is_enabled(&self, kind: FilterKind) -> bool {
        match kind {
            FilterKind::Convert | FilterKind::Resize => false,
            FilterKind::Colorspace => self.colorspace.is_some(),
            FilterKind::Delogo => self.delogo.is_some(),
            FilterKind::Afs => self.afs.is_some(),
            FilterKind::Nnedi => self.nnedi.is_some(),
            FilterKind::Yadif => self.yadif.is_some(),
            FilterKind::Decimate => self.decimate.is_some(),
            FilterKind::MpDecimate => self.mpdecimate.is_some(),
            FilterKind::Convolution3d => self.convolution3d.is_some(),
            FilterKind::Smooth => self.smooth.is_some(),
            FilterKind::Knn => self.knn.is_some(),
            FilterKind::Pmd => self.pmd.is_some(),
            FilterKind::SubBurn => self.subburn.is_some(),
            FilterKind::Unsharp => self.unsharp.is_some(),
            FilterKind::EdgeLevel => self.edgelevel.is_some(),
            FilterKind::WarpSharp => self.warpsharp.is_some(),
            FilterKind::Transform => self.transform.is_some(),
            FilterKind::Curves => self.curves.is_some(),
            FilterKind::Tweak => self.tweak.is_some(),
            FilterKind::Deband => self.deband.is_some(),
            FilterKind::Pad => self.pad.is_some(),
            FilterKind::Overlay => self.overlay.is_some(),
        }
    }

    pub fn deinterlacers(&self) -> Vec<FilterKind> {
        self.enabled()
            .into_iter()
            .filter(|kind| kind.is_deinterlacer())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncParams {
    pub mode: AvSyncMode,
    /// Output timebase; defaults to 1/fps.
    pub timebase: Option<Rational>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricParams {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlParams {
    pub async_depth: usize,
    /// Input pacing in frames per second.
    pub max_fps: Option<f64>,
    pub compute: ComputePolicy,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            async_depth: 3,
            max_fps: None,
            compute: ComputePolicy::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"
version: 1
inputs:
  - path: "clips/*.yuv"
output:
  directory: out
input:
  width: 64
  height: 48
  fps: 30000/1001
encoder:
  codec: raw
  qp: 12
filters:
  yadif: { bob: true }
  tweak: { brightness: 0.1 }
  resize: { width: 32, height: 24 }
trim:
  ranges:
    - { start: 10, end: 20 }
"#;

    #[test]
    fn parses_sections_with_defaults() {
        let job = TranscodeJob::from_yaml(JOB).unwrap();
        assert_eq!(job.input.fps, Rational::new(30000, 1001));
        assert_eq!(job.input.format, PixelFormat::Nv12);
        let encoder = job.encoder.as_ref().unwrap();
        assert_eq!((encoder.codec, encoder.qp, encoder.qp_max), (Some(VideoCodec::Raw), 12, 51));
        assert_eq!(
            job.filters.enabled(),
            vec![FilterKind::Yadif, FilterKind::Tweak]
        );
        assert_eq!(job.filters.resize.target(), Some((32, 24)));
        assert_eq!(job.control.async_depth, 3);
        assert_eq!(job.sync.mode, AvSyncMode::Cfr);
        assert_eq!(job.trim.unwrap().ranges.len(), 1);
    }

    #[test]
    fn output_path_follows_structure() {
        let mut job = TranscodeJob::from_yaml(JOB).unwrap();
        job.output.structure = "{stem}_hw.{ext}".into();
        assert_eq!(
            job.output_path(Path::new("clips/intro.yuv")),
            PathBuf::from("out/intro_hw.rfv")
        );
        job.encoder = None;
        assert_eq!(
            job.output_path(Path::new("clips/intro.yuv")),
            PathBuf::from("out/intro_hw.yuv")
        );
    }

    #[test]
    fn container_is_detected_from_extension() {
        assert_eq!(
            InputContainer::Auto.resolve(Path::new("a/b.RFV")),
            InputContainer::Rfv
        );
        assert_eq!(
            InputContainer::Auto.resolve(Path::new("a/b.yuv")),
            InputContainer::Raw
        );
        assert_eq!(
            InputContainer::Raw.resolve(Path::new("a/b.rfv")),
            InputContainer::Raw
        );
    }

    #[test]
    fn expand_inputs_reports_unmatched_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yuv"), b"").unwrap();
        let mut job = TranscodeJob::from_yaml(JOB).unwrap();
        job.inputs = vec![InputPattern {
            path: format!("{}/*.yuv", dir.path().display()),
        }];
        assert_eq!(job.expand_inputs().unwrap().len(), 1);
        job.inputs[0].path = format!("{}/*.mkv", dir.path().display());
        assert!(job.expand_inputs().is_err());
    }
}
