use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::allocation::PoolPlan;
use crate::job::TranscodeJob;
use crate::pipeline::{EncoderConfig, Pipeline};
use crate::stages::StageDescriptor;
use crate::video::{FrameShape, Rational};

/// Resolved pipeline for one input, written before anything runs.
#[derive(Debug, Serialize)]
pub struct PlanLock {
    pub job_version: u32,
    pub job_hash: String,
    pub generated_at: DateTime<Utc>,
    pub input: String,
    pub output: String,
    pub fps: Rational,
    pub output_shape: FrameShape,
    pub stages: Vec<StageDescriptor>,
    pub pools: Vec<PoolPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder: Option<EncoderConfig>,
}

impl PlanLock {
    pub fn new(job: &TranscodeJob, input: &Path, pipeline: &Pipeline) -> Self {
        Self {
            job_version: job.version,
            job_hash: job_hash(job),
            generated_at: Utc::now(),
            input: input.display().to_string(),
            output: job.output_path(input).display().to_string(),
            fps: pipeline.params().fps,
            output_shape: pipeline.output_shape(),
            stages: pipeline.descriptors(),
            pools: pipeline.pools().to_vec(),
            encoder: pipeline.encoder_config().cloned(),
        }
    }
}

/// SHA-256 over the canonical JSON form of the job.
pub fn job_hash(job: &TranscodeJob) -> String {
    let serialized = serde_json::to_vec(job).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}

pub fn write_plan(lock: &PlanLock, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create plan file: {}", path.display()))?;
    serde_yaml::to_writer(file, lock)
        .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_hash_tracks_content() {
        let yaml = "version: 1\ninputs: [{ path: a.yuv }]\noutput: { directory: out }\n";
        let a = TranscodeJob::from_yaml(yaml).unwrap();
        let b = TranscodeJob::from_yaml(yaml).unwrap();
        assert_eq!(job_hash(&a), job_hash(&b));
        assert_eq!(job_hash(&a).len(), 64);

        let mut c = TranscodeJob::from_yaml(yaml).unwrap();
        c.control.async_depth += 1;
        assert_ne!(job_hash(&a), job_hash(&c));
    }
}
