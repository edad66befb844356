use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::job::EncoderParams;
use crate::source::InputInfo;
use crate::video::{BitstreamUnit, FrameBuffer, FrameMeta, FrameShape, PixelFormat, Rational, VideoCodec};

pub mod reference;

pub use reference::ReferenceDevice;

/// Capabilities and codec contexts of one video device.
pub trait HwDevice: Send + Sync {
    fn name(&self) -> &str;

    fn supports_decode(&self, codec: VideoCodec) -> bool;
    fn supports_encode(&self, codec: VideoCodec) -> bool;

    /// General purpose compute queue for filters.
    fn compute_available(&self) -> bool;

    /// Dedicated scaler that reads codec surface layouts.
    fn fixed_function_scaler(&self) -> bool;

    fn open_decoder(&self, codec: VideoCodec, info: &InputInfo) -> Result<Box<dyn HwDecoder>>;
    fn open_encoder(&self, codec: VideoCodec) -> Result<Box<dyn HwEncoder>>;
}

pub trait HwDecoder: Send {
    fn codec(&self) -> VideoCodec;

    /// Surface layout decoded pictures arrive in.
    fn output_shape(&self) -> FrameShape;

    /// Surfaces the decoder keeps referenced on top of the pipeline's own.
    fn surface_slack(&self) -> usize;

    /// Queues one access unit; `None` signals end of stream.
    fn submit(&mut self, unit: Option<&BitstreamUnit>) -> Result<()>;

    /// Writes the next decoded picture into `target`.
    fn receive(&mut self, target: &mut FrameBuffer) -> Result<Option<FrameMeta>>;

    /// Access units submitted but not yet received.
    fn pending(&self) -> usize;
}

/// Encoder context. Configuration arrives in three groups, each applied whole.
pub trait HwEncoder: Send {
    fn codec(&self) -> VideoCodec;

    fn apply_prep(&mut self, prep: &PrepConfig) -> Result<()>;
    fn apply_rate_control(&mut self, rc: &RateControlConfig) -> Result<()>;
    fn apply_codec(&mut self, codec: &CodecConfig) -> Result<()>;

    /// Input surfaces the encoder may hold before it returns the first unit.
    fn input_slack(&self) -> usize;

    /// `None` drains everything still buffered.
    fn submit(&mut self, frame: Option<(&FrameBuffer, &FrameMeta)>) -> Result<()>;

    fn receive(&mut self) -> Result<Option<BitstreamUnit>>;
}

const STRIDE_ALIGN: u32 = 16;

/// Picture preparation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrepConfig {
    pub width: u32,
    pub height: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub format: PixelFormat,
    pub bit_depth: u8,
    pub rotation: u16,
    pub timebase: Rational,
}

impl PrepConfig {
    pub fn new(shape: FrameShape, rotation: u16, timebase: Rational) -> Result<Self> {
        if !matches!(rotation, 0 | 90 | 180 | 270) {
            return Err(PipelineError::InvalidParameter(format!(
                "rotation must be 0, 90, 180 or 270 (got {rotation})"
            )));
        }
        if !timebase.is_valid() {
            return Err(PipelineError::InvalidParameter(format!(
                "encoder timebase {timebase} is not positive"
            )));
        }
        Ok(Self {
            width: shape.width,
            height: shape.height,
            hor_stride: shape.width.next_multiple_of(STRIDE_ALIGN),
            ver_stride: shape.height.next_multiple_of(STRIDE_ALIGN),
            format: shape.format,
            bit_depth: shape.bit_depth,
            rotation,
            timebase,
        })
    }

    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.width, self.height, self.format).with_format(self.format, self.bit_depth)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RateControlMode {
    #[default]
    Cqp,
    Cbr,
    Vbr,
}

/// Rate control group. Bitrates are in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateControlConfig {
    pub mode: RateControlMode,
    pub bps_target: u64,
    pub bps_max: u64,
    pub bps_min: u64,
    /// `-1` lets the encoder choose.
    pub qp_init: i32,
    pub qp_min: u32,
    pub qp_max: u32,
    pub qp_min_i: u32,
    pub qp_max_i: u32,
    pub qp_delta_ip: i32,
    pub fps_in: Rational,
    pub fps_out: Rational,
    pub gop: u32,
}

impl RateControlConfig {
    pub fn from_params(params: &EncoderParams, fps: Rational) -> Self {
        let target = params.bitrate as u64 * 1000;
        let (bps_max, bps_min) = match params.rate_control {
            RateControlMode::Cqp => (0, 0),
            RateControlMode::Cbr => (target * 17 / 16, target * 15 / 16),
            RateControlMode::Vbr => (params.max_bitrate as u64 * 1000, target / 16),
        };
        let (qp_init, qp_min, qp_max) = match params.rate_control {
            RateControlMode::Cqp => (params.qp as i32, params.qp, params.qp),
            _ => (-1, params.qp_min, params.qp_max),
        };
        Self {
            mode: params.rate_control,
            bps_target: if params.rate_control == RateControlMode::Cqp { 0 } else { target },
            bps_max,
            bps_min,
            qp_init,
            qp_min,
            qp_max,
            qp_min_i: qp_min,
            qp_max_i: qp_max,
            qp_delta_ip: 2,
            fps_in: fps,
            fps_out: fps,
            gop: params.gop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HevcTier {
    Main,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HevcProfile {
    Main,
    Main10,
}

/// Codec specific group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum CodecConfig {
    H264 {
        profile_idc: u32,
        level_idc: u32,
        cabac: bool,
        transform_8x8: bool,
    },
    Hevc {
        profile: HevcProfile,
        level_idc: u32,
        tier: HevcTier,
    },
    Raw,
}

fn parse_level(level: Option<&str>, default: f32) -> Result<f32> {
    match level {
        None => Ok(default),
        Some(text) => text.trim().parse::<f32>().map_err(|_| {
            PipelineError::InvalidParameter(format!("level '{text}' is not a number like 4.1"))
        }),
    }
}

impl CodecConfig {
    pub fn from_params(codec: VideoCodec, params: &EncoderParams, bit_depth: u8) -> Result<Self> {
        match codec {
            VideoCodec::H264 => {
                let profile_idc = match params.profile.as_deref() {
                    None | Some("high") => 100,
                    Some("main") => 77,
                    Some("baseline") => 66,
                    Some(other) => {
                        return Err(PipelineError::InvalidParameter(format!(
                            "unknown h264 profile '{other}'"
                        )));
                    }
                };
                let level = parse_level(params.level.as_deref(), 4.1)?;
                Ok(CodecConfig::H264 {
                    profile_idc,
                    level_idc: (level * 10.0).round() as u32,
                    cabac: profile_idc >= 100,
                    transform_8x8: true,
                })
            }
            VideoCodec::Hevc => {
                let profile = match params.profile.as_deref() {
                    None if bit_depth > 8 => HevcProfile::Main10,
                    None | Some("main") => HevcProfile::Main,
                    Some("main10") => HevcProfile::Main10,
                    Some(other) => {
                        return Err(PipelineError::InvalidParameter(format!(
                            "unknown hevc profile '{other}'"
                        )));
                    }
                };
                let tier = match params.tier.as_deref() {
                    None | Some("main") => HevcTier::Main,
                    Some("high") => HevcTier::High,
                    Some(other) => {
                        return Err(PipelineError::InvalidParameter(format!(
                            "unknown hevc tier '{other}'"
                        )));
                    }
                };
                let level = parse_level(params.level.as_deref(), 4.1)?;
                Ok(CodecConfig::Hevc {
                    profile,
                    level_idc: (level * 30.0).round() as u32,
                    tier,
                })
            }
            VideoCodec::Raw => Ok(CodecConfig::Raw),
            other => Err(PipelineError::UnsupportedCodec {
                codec: other,
                component: "encoder",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(mode: RateControlMode) -> EncoderParams {
        EncoderParams {
            rate_control: mode,
            bitrate: 4000,
            max_bitrate: 8000,
            qp: 26,
            qp_min: 10,
            qp_max: 40,
            ..EncoderParams::default()
        }
    }

    #[test]
    fn cbr_brackets_target_bitrate() {
        let rc = RateControlConfig::from_params(&params(RateControlMode::Cbr), Rational::new(30, 1));
        assert_eq!(rc.bps_target, 4_000_000);
        assert_eq!(rc.bps_max, 4_250_000);
        assert_eq!(rc.bps_min, 3_750_000);
        assert_eq!(rc.qp_init, -1);
        assert_eq!(rc.qp_delta_ip, 2);
    }

    #[test]
    fn vbr_uses_max_bitrate_and_low_floor() {
        let rc = RateControlConfig::from_params(&params(RateControlMode::Vbr), Rational::new(30, 1));
        assert_eq!(rc.bps_max, 8_000_000);
        assert_eq!(rc.bps_min, 250_000);
        assert_eq!((rc.qp_min, rc.qp_max), (10, 40));
    }

    #[test]
    fn cqp_pins_every_quantizer() {
        let rc = RateControlConfig::from_params(&params(RateControlMode::Cqp), Rational::new(25, 1));
        assert_eq!(rc.qp_init, 26);
        assert_eq!((rc.qp_min, rc.qp_max, rc.qp_min_i, rc.qp_max_i), (26, 26, 26, 26));
        assert_eq!(rc.bps_target, 0);
    }

    #[test]
    fn h264_high_profile_enables_cabac() {
        let config = CodecConfig::from_params(VideoCodec::H264, &EncoderParams::default(), 8).unwrap();
        assert_eq!(
            config,
            CodecConfig::H264 {
                profile_idc: 100,
                level_idc: 41,
                cabac: true,
                transform_8x8: true
            }
        );
        let main = EncoderParams {
            profile: Some("main".into()),
            ..EncoderParams::default()
        };
        let config = CodecConfig::from_params(VideoCodec::H264, &main, 8).unwrap();
        assert!(matches!(config, CodecConfig::H264 { cabac: false, .. }));
    }

    #[test]
    fn hevc_picks_main10_for_deep_output() {
        let config = CodecConfig::from_params(VideoCodec::Hevc, &EncoderParams::default(), 10).unwrap();
        assert!(matches!(
            config,
            CodecConfig::Hevc {
                profile: HevcProfile::Main10,
                level_idc: 123,
                tier: HevcTier::Main
            }
        ));
    }

    #[test]
    fn unknown_codec_options_are_rejected() {
        assert!(matches!(
            CodecConfig::from_params(VideoCodec::Av1, &EncoderParams::default(), 8),
            Err(PipelineError::UnsupportedCodec { .. })
        ));
    }

    #[test]
    fn prep_aligns_strides_and_checks_rotation() {
        let shape = FrameShape::new(1918, 1080, PixelFormat::Nv12);
        let prep = PrepConfig::new(shape, 0, Rational::new(1, 30)).unwrap();
        assert_eq!((prep.hor_stride, prep.ver_stride), (1920, 1088));
        assert_eq!(prep.shape(), shape);
        assert!(PrepConfig::new(shape, 45, Rational::new(1, 30)).is_err());
    }
}
