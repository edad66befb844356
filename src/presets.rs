use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::filters::ResizeEngine;
use crate::filters::deinterlace::YadifParams;
use crate::filters::denoise::KnnParams;
use crate::filters::sharpen::UnsharpParams;
use crate::hw::RateControlMode;
use crate::job::{
    ControlParams, EncoderParams, InputParams, InputPattern, MetricParams, OutputSpec,
    ResizeParams, SyncParams, TranscodeJob, VppParams,
};
use crate::quality::QualityGateSpec;
use crate::video::{PicStruct, VideoCodec};

pub const PRESETS: [&str; 3] = ["archive", "deinterlace", "preview"];

/// Renders the named job template to `destination`.
pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let job = preset_job(name)?;
    let rendered = serde_yaml::to_string(&job)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write job file: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

pub fn preset_job(name: &str) -> Result<TranscodeJob> {
    let job = match name {
        "archive" => archive_preset(),
        "deinterlace" => deinterlace_preset(),
        "preview" => preview_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}' (expected one of: {})",
            PRESETS.join(", ")
        ),
    };
    Ok(job)
}

fn base(pattern: &str, directory: &str) -> TranscodeJob {
    TranscodeJob {
        version: 1,
        inputs: vec![InputPattern {
            path: pattern.into(),
        }],
        output: OutputSpec {
            directory: PathBuf::from(directory),
            structure: "{stem}.{ext}".into(),
        },
        input: InputParams {
            width: 1920,
            height: 1080,
            ..InputParams::default()
        },
        encoder: None,
        filters: VppParams::default(),
        trim: None,
        sync: SyncParams::default(),
        metric: MetricParams::default(),
        quality_gates: Vec::new(),
        control: ControlParams::default(),
        aux_outputs: BTreeMap::new(),
    }
}

fn archive_preset() -> TranscodeJob {
    let mut job = base("./capture/**/*.yuv", "./out/archive");
    job.encoder = Some(EncoderParams {
        codec: Some(VideoCodec::Raw),
        rate_control: RateControlMode::Cqp,
        qp: 18,
        ..EncoderParams::default()
    });
    job.filters.knn = Some(KnnParams::default());
    job.metric.enabled = true;
    job.quality_gates.push(QualityGateSpec {
        label: Some("archive-quality".into()),
        min_ssim: Some(0.98),
        ..QualityGateSpec::default()
    });
    job
}

fn deinterlace_preset() -> TranscodeJob {
    let mut job = base("./capture/**/*.yuv", "./out/progressive");
    job.input.pic_struct = PicStruct::Tff;
    job.encoder = Some(EncoderParams {
        codec: Some(VideoCodec::Raw),
        ..EncoderParams::default()
    });
    job.filters.yadif = Some(YadifParams { bob: true });
    job
}

fn preview_preset() -> TranscodeJob {
    let mut job = base("./capture/**/*.yuv", "./out/preview");
    job.encoder = Some(EncoderParams {
        codec: Some(VideoCodec::Raw),
        rate_control: RateControlMode::Cbr,
        bitrate: 1500,
        ..EncoderParams::default()
    });
    job.filters.resize = ResizeParams {
        width: Some(640),
        height: Some(360),
        engine: ResizeEngine::Auto,
        ..ResizeParams::default()
    };
    job.filters.unsharp = Some(UnsharpParams::default());
    job.control.max_fps = Some(120.0);
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterRegistry;
    use crate::validation::validate_job;

    #[test]
    fn every_preset_renders_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FilterRegistry::with_defaults();
        for name in PRESETS {
            let path = generate_preset(name, &dir.path().join(format!("{name}.yaml"))).unwrap();
            let job = TranscodeJob::load(&path).unwrap();
            let report = validate_job(&job, &registry);
            assert!(report.is_ok(), "{name}: {:?}", report.errors);
        }
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let err = preset_job("web").unwrap_err();
        assert!(err.to_string().contains("archive, deinterlace, preview"));
    }
}
