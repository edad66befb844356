use thiserror::Error;

use crate::video::VideoCodec;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Fatal failures raised while building or running a transcode pipeline.
///
/// Construction errors (`Configuration`, `UnsupportedOperation`, `UnsupportedCodec`,
/// `InvalidParameter`, `Allocation`, `InvalidVideoParam`, `InvalidOperation`) abort
/// initialisation before the scheduler starts. Everything else surfaces from the run loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("codec {codec} is not supported by the {component}")]
    UnsupportedCodec {
        codec: VideoCodec,
        component: &'static str,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("invalid video parameter: {0}")]
    InvalidVideoParam(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("stage '{stage}' failed: {message}")]
    StageFailure { stage: String, message: String },

    #[error("output write failed: {0}")]
    Output(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("aborted by user")]
    Aborted,
}

impl PipelineError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Short stable label used in structured logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::UnsupportedOperation(_) => "unsupported_operation",
            Self::UnsupportedCodec { .. } => "unsupported_codec",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::Allocation(_) => "allocation",
            Self::InvalidVideoParam(_) => "invalid_video_param",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::StageFailure { .. } => "stage_failure",
            Self::Output(_) => "output",
            Self::Io(_) => "io",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnsupportedOperation(_)
                | Self::UnsupportedCodec { .. }
                | Self::InvalidParameter(_)
                | Self::Allocation(_)
                | Self::InvalidVideoParam(_)
                | Self::InvalidOperation(_)
        )
    }
}

/// Non-fatal outcome of handing one item to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Input accepted; outputs may be ready to drain.
    Ok,
    /// Input consumed without producing anything yet.
    NeedMoreInput,
    /// No free output buffer; downstream has to release frames first.
    NeedMoreSlots,
    /// The stage has nothing more to give for this (terminal) input.
    EndOfStream,
}

impl StageStatus {
    /// Whether the scheduler should drain outputs after this status.
    pub fn has_output(self) -> bool {
        matches!(self, StageStatus::Ok)
    }

    /// Statuses that keep the main loop alive.
    pub fn keeps_running(self) -> bool {
        matches!(
            self,
            StageStatus::Ok | StageStatus::NeedMoreInput | StageStatus::NeedMoreSlots
        )
    }

    /// Statuses that keep a flush pass alive for the stage being flushed.
    pub fn keeps_flushing(self) -> bool {
        matches!(self, StageStatus::Ok | StageStatus::NeedMoreSlots)
    }
}
