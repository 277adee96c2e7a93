pub mod assignment;
pub mod config;
pub mod counting;
pub mod detection;
pub mod error;
pub mod frame;
pub mod kalman_filter;
pub mod pipeline;
pub mod track;
pub mod tracker;
pub mod utils;

#[cfg(feature = "opencv")]
pub mod source;
#[cfg(feature = "opencv")]
pub mod visualization;
#[cfg(feature = "torch")]
pub mod torch_detector;

// Re-export main types
pub use crate::config::Config;
pub use crate::counting::{CountingLine, Point};
pub use crate::detection::{Detection, DetectionFilter, Detector, ReplayDetector};
pub use crate::error::{ConfigError, Error};
pub use crate::frame::{Frame, FrameSize, FrameSource, Overlay, TrackOverlay};
pub use crate::pipeline::{FrameEvent, PipelineController, PipelineEvent, PipelineState, StopReason};
pub use crate::track::{Track, TrackState};
pub use crate::tracker::{Association, StepReport, Tracker};

#[cfg(feature = "opencv")]
pub use crate::source::{BinaryMask, VideoFileSource};
#[cfg(feature = "torch")]
pub use crate::torch_detector::TorchDetector;
