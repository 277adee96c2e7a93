//! Backend-neutral frame, mask and source abstractions.
//!
//! The pipeline only talks to these traits; the OpenCV implementations live
//! in `source` and `visualization` behind the `opencv` feature.

use std::fmt;

use num_traits::ToPrimitive;
use serde::Serialize;

use crate::counting::{CountingLine, Point};
use crate::track::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        FrameSize { width, height }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Snapshot of one confirmed track, detached from tracker state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackOverlay {
    pub track_id: u64,
    /// `[x, y, width, height]` in whole pixels.
    pub rect: [i32; 4],
    pub centroid: (i32, i32),
    pub class_id: u32,
}

impl TrackOverlay {
    pub fn from_track(track: &Track) -> Self {
        let bbox = track.bbox();
        let px = |v: f32| v.trunc().to_i32().unwrap_or(0);
        let (x1, y1, x2, y2) = (px(bbox[0]), px(bbox[1]), px(bbox[2]), px(bbox[3]));
        TrackOverlay {
            track_id: track.track_id,
            rect: [x1, y1, (x2 - x1).max(0), (y2 - y1).max(0)],
            centroid: track.centroid(),
            class_id: track.class_id,
        }
    }
}

/// Everything drawn onto an emitted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub line_start: Point,
    pub line_end: Point,
    /// A count registered this cycle.
    pub flash: bool,
    pub count: usize,
    pub tracks: Vec<TrackOverlay>,
}

impl Overlay {
    pub fn new(line: &CountingLine, tracks: Vec<TrackOverlay>, flash: bool) -> Self {
        Overlay {
            line_start: line.start(),
            line_end: line.end(),
            flash,
            count: line.count(),
            tracks,
        }
    }
}

/// An image the pipeline can mask and annotate.
pub trait Frame: Sized + Send + 'static {
    type Mask: Send + 'static;

    /// Checked against the mask before every masked detection.
    fn size(&self) -> FrameSize;

    fn mask_size(mask: &Self::Mask) -> FrameSize;

    /// Bitwise intersection of the frame with a same-sized binary mask.
    fn apply_mask(&self, mask: &Self::Mask) -> anyhow::Result<Self>;

    fn annotate(&mut self, overlay: &Overlay) -> anyhow::Result<()>;
}

/// Sequential frame producer, e.g. a decoded video file.
pub trait FrameSource: Send + 'static {
    type Frame: Frame;

    fn frame_size(&self) -> FrameSize;

    /// `Ok(None)` at end of stream; `Err` on a decode failure.
    fn read(&mut self) -> anyhow::Result<Option<Self::Frame>>;

    fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    type Frame = S::Frame;

    fn frame_size(&self) -> FrameSize {
        (**self).frame_size()
    }

    fn read(&mut self) -> anyhow::Result<Option<Self::Frame>> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LineConfig;
    use crate::detection::Detection;
    use crate::kalman_filter::KalmanFilter;

    #[test]
    fn test_frame_size_display() {
        assert_eq!(FrameSize::new(1280, 720).to_string(), "1280x720");
    }

    #[test]
    fn test_track_overlay_truncates_to_pixels() {
        let det = Detection::from_xyxy(320.0, 277.0, 380.0, 317.0, 0.9, 2);
        let track = Track::new(3, &det, 1, &KalmanFilter::new());
        let overlay = TrackOverlay::from_track(&track);
        assert_eq!(overlay.track_id, 3);
        assert_eq!(overlay.rect, [320, 277, 60, 40]);
        assert_eq!(overlay.centroid, (350, 297));
    }

    #[test]
    fn test_overlay_takes_line_state() {
        let line = CountingLine::from_config(&LineConfig::default());
        let overlay = Overlay::new(&line, Vec::new(), true);
        assert_eq!(overlay.line_start, Point::new(400, 297));
        assert_eq!(overlay.line_end, Point::new(673, 297));
        assert_eq!(overlay.count, 0);
        assert!(overlay.flash);
    }
}
