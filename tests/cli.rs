use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::tempdir;

fn write_clip(path: &Path, frames: usize) {
    let (width, height) = (32usize, 16usize);
    let mut data = Vec::with_capacity(frames * width * height * 3 / 2);
    for frame in 0..frames {
        data.extend((0..width * height).map(|i| ((i + frame) % 200 + 20) as u8));
        data.extend(std::iter::repeat_n(128u8, width * height / 2));
    }
    fs::write(path, data).unwrap();
}

fn write_job(dir: &Path, extra: &str) -> std::path::PathBuf {
    let job = dir.join("job.yaml");
    let yaml = format!(
        "version: 1\n\
         inputs:\n  - path: \"{}\"\n\
         output:\n  directory: \"{}\"\n\
         input: {{ width: 32, height: 16 }}\n{extra}",
        dir.join("*.yuv").display(),
        dir.join("out").display()
    );
    fs::write(&job, yaml).unwrap();
    job
}

fn hwtranscode() -> Command {
    Command::cargo_bin("hwtranscode").expect("binary present")
}

#[test]
fn run_writes_stream_and_metrics() {
    let temp = tempdir().unwrap();
    write_clip(&temp.path().join("clip.yuv"), 10);
    let job = write_job(temp.path(), "encoder: { codec: raw }\n");
    let metrics = temp.path().join("metrics/run.json");
    let prometheus = temp.path().join("metrics/run.prom");

    hwtranscode()
        .arg("run")
        .arg(&job)
        .arg("--metrics-json")
        .arg(&metrics)
        .arg("--metrics-prometheus")
        .arg(&prometheus)
        .assert()
        .success();

    assert!(temp.path().join("out/clip.rfv").is_file());
    let snapshot: serde_json::Value = serde_json::from_slice(&fs::read(&metrics).unwrap()).unwrap();
    assert_eq!(snapshot["units_written"], 10);
    assert_eq!(snapshot["jobs_completed"], 1);
    let text = fs::read_to_string(&prometheus).unwrap();
    assert!(text.contains("hwtc_frames_read_total 10"));
}

#[test]
fn run_fails_for_conflicting_deinterlacers() {
    let temp = tempdir().unwrap();
    write_clip(&temp.path().join("clip.yuv"), 2);
    let job = write_job(
        temp.path(),
        "encoder: { codec: raw }\nfilters:\n  yadif: {}\n  afs: {}\n",
    );

    hwtranscode().arg("run").arg(&job).assert().failure().code(1);
    assert!(!temp.path().join("out/clip.rfv").exists());
}

#[test]
fn compute_flag_overrides_the_job() {
    let temp = tempdir().unwrap();
    write_clip(&temp.path().join("clip.yuv"), 2);
    let job = write_job(temp.path(), "encoder: { codec: raw }\nfilters:\n  tweak: {}\n");

    hwtranscode()
        .args(["run", "--compute", "disabled"])
        .arg(&job)
        .assert()
        .failure();
    hwtranscode().arg("run").arg(&job).assert().success();
}

#[test]
fn plan_writes_stage_list_and_pools() {
    let temp = tempdir().unwrap();
    write_clip(&temp.path().join("clip.yuv"), 2);
    let job = write_job(
        temp.path(),
        "encoder: { codec: raw }\nfilters:\n  resize: { width: 16, height: 8 }\n",
    );
    let plan = temp.path().join("plans/plan.yaml");

    hwtranscode().arg("plan").arg(&job).arg(&plan).assert().success();

    let lock: serde_yaml::Value = serde_yaml::from_str(&fs::read_to_string(&plan).unwrap()).unwrap();
    assert_eq!(lock["job_hash"].as_str().map(str::len), Some(64));
    let stages = lock["stages"].as_sequence().unwrap();
    assert_eq!(stages.first().unwrap()["kind"], "input");
    assert_eq!(stages.last().unwrap()["kind"], "encode");
    assert!(!lock["pools"].as_sequence().unwrap().is_empty());
    assert!(!temp.path().join("out/clip.rfv").exists());
}

#[test]
fn job_new_and_lint_round_trip() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("jobs/preview.yaml");

    hwtranscode()
        .args(["job", "new", "--preset", "preview", "--output"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.is_file());

    hwtranscode().args(["job", "lint"]).arg(&path).assert().success();
    hwtranscode().arg("validate").arg(&path).assert().success();

    hwtranscode()
        .args(["job", "new", "--preset", "web"])
        .assert()
        .failure();
}

#[test]
fn validate_reports_bad_jobs() {
    let temp = tempdir().unwrap();
    let job = write_job(temp.path(), "metric: { enabled: true }\n");
    hwtranscode().arg("validate").arg(&job).assert().failure();
}

#[test]
fn list_filters_prints_catalogue() {
    let output = hwtranscode().arg("list-filters").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("- yadif"));
    assert!(stdout.contains("- resize"));
    assert!(!stdout.contains("- convert"));
}

#[test]
fn completions_are_generated() {
    hwtranscode()
        .args(["completions", "bash"])
        .assert()
        .success();
}
