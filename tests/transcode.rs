use std::fs;
use std::path::Path;
use std::sync::Arc;

use hwtranscode::hw::ReferenceDevice;
use hwtranscode::job::TranscodeJob;
use hwtranscode::pipeline::PipelineExecutor;
use hwtranscode::scheduler::RunState;
use tempfile::tempdir;

const FRAMES: usize = 12;

fn write_raw_clip(path: &Path) -> Vec<u8> {
    let (width, height) = (48usize, 32usize);
    let mut data = Vec::new();
    for frame in 0..FRAMES {
        for y in 0..height {
            for x in 0..width {
                data.push(((x * 4 + y * 2 + frame * 5) % 220 + 16) as u8);
            }
        }
        for i in 0..width * height / 2 {
            data.push(if i % 2 == 0 { 110 } else { 150 });
        }
    }
    fs::write(path, &data).unwrap();
    data
}

fn load(dir: &Path, input: &Path, output: &str, extra: &str) -> TranscodeJob {
    let yaml = format!(
        "version: 1\n\
         inputs:\n  - path: \"{}\"\n\
         output:\n  directory: \"{}\"\n\
         input: {{ width: 48, height: 32 }}\n{extra}",
        input.display(),
        dir.join(output).display()
    );
    TranscodeJob::from_yaml(&yaml).unwrap()
}

fn executor(job: TranscodeJob) -> PipelineExecutor {
    PipelineExecutor::new(job, Arc::new(ReferenceDevice::new()))
}

#[test]
fn encoded_stream_decodes_back_to_the_source_pictures() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("clip.yuv");
    let original = write_raw_clip(&input);

    let encode = executor(load(temp.path(), &input, "encoded", "encoder: { codec: raw, qp: 0 }\n"));
    let results = encode.execute().unwrap();
    assert_eq!(results.len(), 1);
    let stream = results[0].output.clone();
    assert_eq!(stream.extension().and_then(|ext| ext.to_str()), Some("rfv"));
    assert_eq!(results[0].summary.state, RunState::Done);
    assert_eq!(results[0].summary.counters.units_written, FRAMES as u64);

    let decode = executor(load(temp.path(), &stream, "decoded", ""));
    let results = decode.execute().unwrap();
    let decoded = fs::read(&results[0].output).unwrap();
    assert_eq!(decoded.len(), original.len());
    assert_eq!(decoded, original);
}

#[test]
fn quality_metric_scores_every_frame_and_passes_gate() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("clip.yuv");
    write_raw_clip(&input);

    let job = load(
        temp.path(),
        &input,
        "scored",
        "encoder: { codec: raw, qp: 0 }\n\
         metric: { enabled: true }\n\
         quality_gates:\n  - { label: lossless, min_ssim: 0.99 }\n",
    );
    let executor = executor(job);
    let results = executor.execute().unwrap();

    let quality = results[0].quality.as_ref().unwrap();
    assert_eq!(quality.frames, FRAMES as u64);
    assert_eq!(quality.unmatched, 0);
    assert!(quality.min_ssim > 0.99);

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.jobs_completed, 1);
    assert_eq!(snapshot.quality_passes, 1);
    assert_eq!(snapshot.units_written, FRAMES as u64);
}

#[test]
fn failing_quality_gate_fails_the_job() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("clip.yuv");
    write_raw_clip(&input);

    let job = load(
        temp.path(),
        &input,
        "gated",
        "encoder: { codec: raw, qp: 0 }\n\
         metric: { enabled: true }\n\
         quality_gates:\n  - { label: impossible, min_ssim: 1.5 }\n",
    );
    let executor = executor(job);
    let err = executor.execute().unwrap_err();
    assert!(format!("{err:#}").contains("Quality gate 'impossible' failed"));

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.jobs_failed, 1);
    assert_eq!(snapshot.quality_failures, 1);
}

#[test]
fn raw_input_without_size_is_rejected() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("clip.yuv");
    write_raw_clip(&input);

    let yaml = format!(
        "version: 1\ninputs:\n  - path: \"{}\"\noutput:\n  directory: \"{}\"\n",
        input.display(),
        temp.path().join("out").display()
    );
    let job = TranscodeJob::from_yaml(&yaml).unwrap();
    let err = executor(job).execute().unwrap_err();
    assert!(err.to_string().contains("needs input.width and input.height"));
}

#[test]
fn crop_is_applied_while_reading() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("clip.yuv");
    write_raw_clip(&input);

    let mut job = load(temp.path(), &input, "cropped", "encoder: { codec: raw }\n");
    job.input.crop.left = 8;
    job.input.crop.right = 8;
    let executor = executor(job);
    let pipeline = executor.build(&input).unwrap();
    assert_eq!(
        (pipeline.output_shape().width, pipeline.output_shape().height),
        (32, 32)
    );
}
