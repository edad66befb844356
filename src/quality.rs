use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use image::GrayImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::hw::HwDecoder;
use crate::observability::MetricsCollector;
use crate::stages::PipelineFrame;
use crate::video::{BitstreamUnit, FrameBuffer, MemoryDomain};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityMetrics {
    pub mse: f64,
    pub psnr: f64,
    pub ssim: f64,
}

/// Luma plane as an 8-bit image.
pub fn luma_image(frame: &FrameBuffer) -> Result<GrayImage> {
    let (w, h) = frame.luma_size();
    GrayImage::from_raw(w as u32, h as u32, frame.luma_u8()).ok_or_else(|| {
        PipelineError::stage("quality", format!("cannot view a {w}x{h} luma plane as an image"))
    })
}

pub fn compute_metrics(reference: &GrayImage, candidate: &GrayImage) -> Result<QualityMetrics> {
    if reference.dimensions() != candidate.dimensions() {
        return Err(PipelineError::stage(
            "quality",
            format!(
                "cannot compare {}x{} with {}x{}",
                reference.width(),
                reference.height(),
                candidate.width(),
                candidate.height()
            ),
        ));
    }
    let mse = mean_squared_error(reference, candidate);
    Ok(QualityMetrics {
        mse,
        psnr: peak_signal_to_noise_ratio(mse),
        ssim: structural_similarity(reference, candidate),
    })
}

fn mean_squared_error(reference: &GrayImage, candidate: &GrayImage) -> f64 {
    let total: f64 = reference
        .pixels()
        .zip(candidate.pixels())
        .map(|(r, c)| {
            let diff = r[0] as f64 - c[0] as f64;
            diff * diff
        })
        .sum();
    total / (reference.width() * reference.height()) as f64
}

fn peak_signal_to_noise_ratio(mse: f64) -> f64 {
    if mse == 0.0 {
        f64::INFINITY
    } else {
        20.0 * 255.0f64.log10() - 10.0 * mse.log10()
    }
}

/// Single-window SSIM over the whole plane.
fn structural_similarity(reference: &GrayImage, candidate: &GrayImage) -> f64 {
    let mean_ref = mean(reference);
    let mean_cand = mean(candidate);
    let var_ref = variance(reference, mean_ref);
    let var_cand = variance(candidate, mean_cand);
    let cov = covariance(reference, candidate, mean_ref, mean_cand);

    let c1 = (0.01_f64 * 255.0).powi(2);
    let c2 = (0.03_f64 * 255.0).powi(2);

    let numerator = (2.0 * mean_ref * mean_cand + c1) * (2.0 * cov + c2);
    let denominator = (mean_ref.powi(2) + mean_cand.powi(2) + c1) * (var_ref + var_cand + c2);
    numerator / denominator
}

fn mean(image: &GrayImage) -> f64 {
    image.pixels().map(|p| p[0] as f64).sum::<f64>() / (image.width() * image.height()) as f64
}

fn variance(image: &GrayImage, mean: f64) -> f64 {
    image
        .pixels()
        .map(|p| {
            let diff = p[0] as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / (image.width() * image.height()) as f64
}

fn covariance(reference: &GrayImage, candidate: &GrayImage, mean_ref: f64, mean_cand: f64) -> f64 {
    reference
        .pixels()
        .zip(candidate.pixels())
        .map(|(r, c)| (r[0] as f64 - mean_ref) * (c[0] as f64 - mean_cand))
        .sum::<f64>()
        / (reference.width() * reference.height()) as f64
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FrameScore {
    pub timestamp: i64,
    #[serde(flatten)]
    pub metrics: QualityMetrics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualitySummary {
    pub frames: u64,
    pub mean_ssim: f64,
    pub min_ssim: f64,
    pub mean_psnr: f64,
    pub mean_mse: f64,
    /// Frames seen on only one side of the encoder.
    pub unmatched: u64,
}

/// Compares pre-encode frames with their decoded bitstream, matched by timestamp.
pub struct QualityMetric {
    decoder: Box<dyn HwDecoder>,
    scratch: FrameBuffer,
    references: BTreeMap<i64, GrayImage>,
    scores: Vec<FrameScore>,
    unmatched: u64,
    finished: bool,
}

pub type SharedMetric = Arc<Mutex<QualityMetric>>;

impl QualityMetric {
    pub fn new(decoder: Box<dyn HwDecoder>) -> Result<Self> {
        let scratch = FrameBuffer::allocate(decoder.output_shape(), MemoryDomain::System)?;
        Ok(Self {
            decoder,
            scratch,
            references: BTreeMap::new(),
            scores: Vec::new(),
            unmatched: 0,
            finished: false,
        })
    }

    pub fn shared(self) -> SharedMetric {
        Arc::new(Mutex::new(self))
    }

    pub fn add_reference(&mut self, frame: &PipelineFrame) -> Result<()> {
        let image = luma_image(&frame.handle.lock())?;
        self.references.insert(frame.meta.timestamp, image);
        Ok(())
    }

    pub fn add_encoded(&mut self, unit: &BitstreamUnit) -> Result<()> {
        self.decoder.submit(Some(unit))?;
        self.score_decoded()
    }

    /// Ends the decoded stream. References no encoded unit matched count as unmatched.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.decoder.submit(None)?;
        self.score_decoded()?;
        if !self.references.is_empty() {
            warn!(frames = self.references.len(), "Reference frames were never encoded");
            self.unmatched += self.references.len() as u64;
            self.references.clear();
        }
        Ok(())
    }

    fn score_decoded(&mut self) -> Result<()> {
        while let Some(meta) = self.decoder.receive(&mut self.scratch)? {
            let Some(reference) = self.references.remove(&meta.timestamp) else {
                warn!(timestamp = meta.timestamp, "Encoded frame has no reference frame");
                self.unmatched += 1;
                continue;
            };
            let candidate = luma_image(&self.scratch)?;
            let metrics = compute_metrics(&reference, &candidate)?;
            debug!(timestamp = meta.timestamp, ssim = metrics.ssim, psnr = metrics.psnr, "Frame scored");
            self.scores.push(FrameScore {
                timestamp: meta.timestamp,
                metrics,
            });
        }
        Ok(())
    }

    pub fn scores(&self) -> &[FrameScore] {
        &self.scores
    }

    pub fn summary(&self) -> QualitySummary {
        let frames = self.scores.len();
        if frames == 0 {
            return QualitySummary {
                unmatched: self.unmatched,
                ..QualitySummary::default()
            };
        }
        let n = frames as f64;
        let finite_psnr = |psnr: f64| if psnr.is_finite() { psnr } else { 100.0 };
        QualitySummary {
            frames: frames as u64,
            mean_ssim: self.scores.iter().map(|s| s.metrics.ssim).sum::<f64>() / n,
            min_ssim: self
                .scores
                .iter()
                .map(|s| s.metrics.ssim)
                .fold(f64::INFINITY, f64::min),
            mean_psnr: self
                .scores
                .iter()
                .map(|s| finite_psnr(s.metrics.psnr))
                .sum::<f64>()
                / n,
            mean_mse: self.scores.iter().map(|s| s.metrics.mse).sum::<f64>() / n,
            unmatched: self.unmatched,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QualityGateSpec {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub min_ssim: Option<f64>,
    #[serde(default)]
    pub min_psnr: Option<f64>,
    #[serde(default)]
    pub max_mse: Option<f64>,
}

/// Fails on the first gate the run does not meet. Gate SSIM is the run minimum.
pub fn check_gates(
    summary: &QualitySummary,
    gates: &[QualityGateSpec],
    metrics: &MetricsCollector,
) -> anyhow::Result<()> {
    if gates.is_empty() {
        return Ok(());
    }
    if summary.frames == 0 {
        metrics.record_quality_failure();
        bail!("Quality gates configured but no frame was scored");
    }
    let mut failure: Option<String> = None;
    for gate in gates {
        if let Some(min_ssim) = gate.min_ssim
            && summary.min_ssim < min_ssim
        {
            failure = Some(format!(
                "Quality gate '{}' failed: SSIM {:.5} < {:.5}",
                gate.label.as_deref().unwrap_or("ssim"),
                summary.min_ssim,
                min_ssim
            ));
            break;
        }
        if let Some(min_psnr) = gate.min_psnr
            && summary.mean_psnr < min_psnr
        {
            failure = Some(format!(
                "Quality gate '{}' failed: PSNR {:.2} < {:.2}",
                gate.label.as_deref().unwrap_or("psnr"),
                summary.mean_psnr,
                min_psnr
            ));
            break;
        }
        if let Some(max_mse) = gate.max_mse
            && summary.mean_mse > max_mse
        {
            failure = Some(format!(
                "Quality gate '{}' failed: MSE {:.4} > {:.4}",
                gate.label.as_deref().unwrap_or("mse"),
                summary.mean_mse,
                max_mse
            ));
            break;
        }
    }

    if let Some(reason) = failure {
        metrics.record_quality_failure();
        bail!(reason);
    }
    metrics.record_quality_pass();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::pool::FrameBufferPool;
    use crate::video::{FrameMeta, FrameShape, PixelFormat, VideoCodec};

    /// Returns each picture only after the next unit arrives, or at end of stream.
    struct OneBehind {
        shape: FrameShape,
        held: VecDeque<i64>,
        ready: VecDeque<i64>,
    }

    impl HwDecoder for OneBehind {
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
            match unit {
                Some(unit) => {
                    self.held.push_back(unit.pts);
                    while self.held.len() > 1 {
                        self.ready.extend(self.held.pop_front());
                    }
                }
                None => self.ready.extend(self.held.drain(..)),
            }
            Ok(())
        }

        fn receive(&mut self, _target: &mut FrameBuffer) -> Result<Option<FrameMeta>> {
            Ok(self.ready.pop_front().map(|pts| FrameMeta::new(pts, 1, 0)))
        }

        fn pending(&self) -> usize {
            self.held.len() + self.ready.len()
        }
    }

    fn gradient(offset: u8) -> GrayImage {
        GrayImage::from_fn(16, 16, |x, y| image::Luma([(x * 8 + y) as u8 + offset]))
    }

    #[test]
    fn identical_planes_score_perfectly() {
        let metrics = compute_metrics(&gradient(0), &gradient(0)).unwrap();
        assert_eq!(metrics.mse, 0.0);
        assert!(metrics.psnr.is_infinite());
        assert!((metrics.ssim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn offset_lowers_psnr_but_not_below_bound() {
        let metrics = compute_metrics(&gradient(0), &gradient(4)).unwrap();
        assert_eq!(metrics.mse, 16.0);
        assert!((metrics.psnr - 36.09).abs() < 0.01);
        assert!(metrics.ssim < 1.0 && metrics.ssim > 0.9);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let small = GrayImage::new(8, 8);
        assert!(compute_metrics(&small, &gradient(0)).is_err());
    }

    #[test]
    fn gates_report_first_failure() {
        let summary = QualitySummary {
            frames: 3,
            mean_ssim: 0.97,
            min_ssim: 0.95,
            mean_psnr: 38.0,
            mean_mse: 10.0,
            unmatched: 0,
        };
        let metrics = MetricsCollector::new();
        let strict = vec![QualityGateSpec {
            label: Some("strict".into()),
            min_ssim: Some(0.99),
            ..QualityGateSpec::default()
        }];
        let err = check_gates(&summary, &strict, &metrics).unwrap_err();
        assert!(err.to_string().contains("strict"));
        let loose = vec![QualityGateSpec {
            min_psnr: Some(30.0),
            max_mse: Some(20.0),
            ..QualityGateSpec::default()
        }];
        check_gates(&summary, &loose, &metrics).unwrap();
        let snapshot = metrics.snapshot();
        assert_eq!((snapshot.quality_passes, snapshot.quality_failures), (1, 1));
    }

    #[test]
    fn finish_scores_buffered_pictures_and_counts_leftovers() {
        let shape = FrameShape::new(16, 16, PixelFormat::Nv12);
        let decoder = OneBehind {
            shape,
            held: VecDeque::new(),
            ready: VecDeque::new(),
        };
        let mut metric = QualityMetric::new(Box::new(decoder)).unwrap();
        let mut pool = FrameBufferPool::new("metric-test");
        pool.allocate(4, shape, MemoryDomain::System).unwrap();
        for index in 0..4u64 {
            let frame = PipelineFrame::new(
                pool.checkout().unwrap(),
                FrameMeta::new(index as i64 * 10, 10, index),
            );
            metric.add_reference(&frame).unwrap();
        }
        for pts in [0, 10, 20] {
            metric.add_encoded(&BitstreamUnit::from_slice(&[0], pts, pts)).unwrap();
        }
        assert_eq!(metric.summary().frames, 2);

        metric.finish().unwrap();
        metric.finish().unwrap();
        let summary = metric.summary();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.unmatched, 1);
        assert!((summary.min_ssim - 1.0).abs() < 1e-9);
    }
}
