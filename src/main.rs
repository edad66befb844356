use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use hwtranscode::filters::FilterRegistry;
use hwtranscode::hw::ReferenceDevice;
use hwtranscode::job::TranscodeJob;
use hwtranscode::observability::{MetricsCollector, log_snapshot};
#[cfg(feature = "metrics-server")]
use hwtranscode::observability::server::MetricsServer;
use hwtranscode::pipeline::PipelineExecutor;
use hwtranscode::plan::{PlanLock, write_plan};
use hwtranscode::presets::{PRESETS, generate_preset};
use hwtranscode::scheduler::{CancelToken, ComputePolicy};
use hwtranscode::validation::{ValidationReport, validate_job};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint = match &command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };
    configure_tracing(otlp_endpoint.as_deref())?;

    let result = match command {
        Commands::Run(args) => run_job(args),
        Commands::Validate { job } => validate_job_cmd(&job),
        Commands::Plan {
            job,
            output,
            compute,
        } => plan_job(&job, &output, compute),
        Commands::Job { action } => job_command(action),
        Commands::ListFilters => {
            list_filters();
            Ok(())
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "hwtranscode", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "Finished with error");
    }
    result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    if let Some(endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "hwtranscode"),
            ])))
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_simple()?;

        return tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()));
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))
}

fn load_job(path: &Path, compute: Option<ComputePolicy>) -> Result<TranscodeJob> {
    let mut job = TranscodeJob::load(path)?;
    if let Some(policy) = compute {
        job.control.compute = policy;
    }
    Ok(job)
}

fn run_job(args: RunArgs) -> Result<()> {
    let job = load_job(&args.job, args.compute)?;
    let report = validate_job(&job, &FilterRegistry::with_defaults());
    report_validation(&args.job, &report);
    if !report.is_ok() {
        bail!("Job validation failed with {} error(s)", report.errors.len());
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %err, "Cannot install the interrupt handler");
    }

    let metrics = MetricsCollector::global().clone();
    let executor = PipelineExecutor::new(job, Arc::new(ReferenceDevice::new()))
        .with_cancel(cancel)
        .with_metrics(metrics.clone());

    #[cfg(feature = "metrics-server")]
    let metrics_server = match &args.metrics_listen {
        Some(listen) => {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("Invalid metrics listen address: {listen}"))?;
            Some(MetricsServer::start(addr, metrics.clone())?)
        }
        None => None,
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(listen) = &args.metrics_listen {
        warn!("Metrics server feature not enabled; ignoring --metrics-listen={listen}.");
    }

    let outcome = executor.execute();

    let snapshot = metrics.snapshot();
    if args.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &args.metrics_json {
        create_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &args.metrics_prometheus {
        create_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    for result in outcome? {
        info!(
            input = %result.input.display(),
            output = %result.output.display(),
            frames_read = result.summary.counters.frames_read,
            units = result.summary.counters.units_written,
            elapsed_ms = result.summary.elapsed_ms,
            "Transcode completed"
        );
    }
    Ok(())
}

fn report_validation(path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
}

fn validate_job_cmd(path: &Path) -> Result<()> {
    let job = TranscodeJob::load(path)?;
    let report = validate_job(&job, &FilterRegistry::with_defaults());
    report_validation(path, &report);
    if !report.is_ok() {
        bail!("Job validation failed with {} error(s)", report.errors.len());
    }
    info!(file = %path.display(), "Job validation passed");
    Ok(())
}

fn plan_job(path: &Path, output: &Path, compute: Option<ComputePolicy>) -> Result<()> {
    let job = load_job(path, compute)?;
    let report = validate_job(&job, &FilterRegistry::with_defaults());
    report_validation(path, &report);
    if !report.is_ok() {
        bail!(
            "Cannot plan the job due to {} validation error(s)",
            report.errors.len()
        );
    }

    let input = job
        .expand_inputs()?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Job has no inputs to plan"))?;
    let executor = PipelineExecutor::new(job, Arc::new(ReferenceDevice::new()));
    let pipeline = executor.build(&input)?;
    let lock = PlanLock::new(executor.job(), &input, &pipeline);

    create_parent(output)?;
    write_plan(&lock, output)?;
    info!(
        plan = %output.display(),
        stages = lock.stages.len(),
        pools = lock.pools.len(),
        "Plan written"
    );
    Ok(())
}

fn job_command(command: JobCommands) -> Result<()> {
    match command {
        JobCommands::New { preset, output } => {
            let destination = output.unwrap_or_else(|| PathBuf::from(format!("jobs/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(preset = %preset, path = %generated.display(), "Job file generated");
            Ok(())
        }
        JobCommands::Lint { jobs } => lint_jobs(&jobs),
    }
}

fn lint_jobs(jobs: &[PathBuf]) -> Result<()> {
    let registry = FilterRegistry::with_defaults();
    let mut failures = 0usize;

    for path in jobs {
        match TranscodeJob::load(path) {
            Ok(job) => {
                let report = validate_job(&job, &registry);
                report_validation(path, &report);
                if report.is_ok() {
                    info!(file = %path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load job: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} job file(s)");
    }
    info!("All job lint checks passed");
    Ok(())
}

fn list_filters() {
    println!("Available filters:");
    for name in FilterRegistry::with_defaults().known_filters() {
        println!("- {name}");
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "hwtranscode",
    version,
    about = "Hardware-accelerated video transcode pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcode every input matched by a job file.
    Run(RunArgs),
    Validate {
        job: PathBuf,
    },
    /// Build the pipeline for the first input and write its plan without running it.
    Plan {
        job: PathBuf,
        output: PathBuf,
        #[arg(long, value_enum)]
        compute: Option<ComputePolicy>,
    },
    Job {
        #[command(subcommand)]
        action: JobCommands,
    },
    ListFilters,
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    job: PathBuf,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "metrics-listen")]
    metrics_listen: Option<String>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
    /// Overrides `control.compute` from the job file.
    #[arg(long, value_enum)]
    compute: Option<ComputePolicy>,
}

#[derive(Subcommand)]
enum JobCommands {
    New {
        #[arg(long, value_parser = PRESETS)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        jobs: Vec<PathBuf>,
    },
}
