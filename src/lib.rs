pub mod allocation;
pub mod error;
pub mod filters;
pub mod hw;
pub mod job;
pub mod observability;
pub mod pipeline;
pub mod plan;
pub mod pool;
pub mod presets;
pub mod quality;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod stages;
pub mod validation;
pub mod video;

pub use error::{PipelineError, Result, StageStatus};
pub use job::TranscodeJob;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineExecutor, TranscodeResult, build_pipeline};
pub use scheduler::{CancelToken, Scheduler};
