use thiserror::Error;

use crate::frame::FrameSize;
use crate::pipeline::PipelineState;

/// Configuration problems, reported synchronously by the control operation
/// that hit them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no video source loaded")]
    MissingSource,
    #[error("could not read mask image {path}")]
    MaskUnreadable { path: String },
    #[error("mask size {mask} does not match frame size {frame}")]
    MaskSizeMismatch { mask: FrameSize, frame: FrameSize },
    #[error("could not open video source {path}")]
    SourceOpen { path: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("allowed class {0:?} is not in the class table")]
    UnknownClass(String),
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot {op} while {state}")]
    InvalidTransition { op: &'static str, state: PipelineState },

    #[error("detector failed: {0:#}")]
    Detector(anyhow::Error),

    #[error("frame operation failed: {0:#}")]
    Frame(anyhow::Error),

    #[error("pipeline worker panicked")]
    WorkerPanicked,

    #[error("spawning pipeline worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
