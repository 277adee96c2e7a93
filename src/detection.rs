use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::SVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClassConfig;
use crate::error::ConfigError;

/// A single detection result in pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `[x1, y1, x2, y2]`
    pub tlbr: SVector<f32, 4>,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn new(tlbr: SVector<f32, 4>, confidence: f32, class_id: u32) -> Self {
        Self {
            tlbr,
            confidence,
            class_id,
        }
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Self {
        Self::new(SVector::<f32, 4>::new(x1, y1, x2, y2), confidence, class_id)
    }

    pub fn tlbr(&self) -> &SVector<f32, 4> {
        &self.tlbr
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Finite coordinates with `x1 < x2` and `y1 < y2`.
    pub fn has_valid_box(&self) -> bool {
        self.tlbr.iter().all(|v| v.is_finite()) && self.tlbr[0] < self.tlbr[2] && self.tlbr[1] < self.tlbr[3]
    }
}

/// Detection adapter: maps a frame to raw detections.
///
/// Called at most once per pipeline cycle. Implementations should not depend
/// on call order beyond what [`Detector::reset`] restores.
pub trait Detector<F>: Send {
    fn detect(&mut self, frame: &F) -> Result<Vec<Detection>>;

    /// Called when a new source is loaded at frame 0.
    fn reset(&mut self) {}
}

impl<F, D: Detector<F> + ?Sized> Detector<F> for Box<D> {
    fn detect(&mut self, frame: &F) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Keeps detections of allowed classes above the confidence floor.
#[derive(Debug, Clone)]
pub struct DetectionFilter {
    allowed: HashSet<u32>,
    confidence_floor: f32,
}

impl DetectionFilter {
    pub fn new(allowed: HashSet<u32>, confidence_floor: f32) -> Self {
        Self {
            allowed,
            confidence_floor,
        }
    }

    /// Resolve the allow-list labels against the class-name table.
    pub fn from_config(classes: &ClassConfig) -> Result<Self, ConfigError> {
        let mut allowed = HashSet::new();
        for label in &classes.allowed {
            let id = classes
                .id_of(label)
                .ok_or_else(|| ConfigError::UnknownClass(label.clone()))?;
            allowed.insert(id);
        }
        Ok(Self::new(allowed, classes.confidence_floor))
    }

    pub fn allows(&self, det: &Detection) -> bool {
        self.allowed.contains(&det.class_id) && det.confidence > self.confidence_floor && det.has_valid_box()
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let total = detections.len();
        let kept: Vec<Detection> = detections.into_iter().filter(|d| self.allows(d)).collect();
        if kept.len() != total {
            debug!(kept = kept.len(), total, "filtered detections");
        }
        kept
    }
}

/// One detection as stored in a replay file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
}

/// All detections of one frame; `frame` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDetections {
    pub frame: u64,
    pub detections: Vec<DetectionRecord>,
}

/// Replays precomputed detections frame by frame, e.g. from a model run
/// exported offline.
#[derive(Debug, Clone, Default)]
pub struct ReplayDetector {
    frames: HashMap<u64, Vec<Detection>>,
    next_frame: u64,
}

impl ReplayDetector {
    pub fn new(frames: Vec<FrameDetections>) -> Self {
        let frames = frames
            .into_iter()
            .map(|f| {
                let dets = f
                    .detections
                    .into_iter()
                    .map(|r| {
                        let [x1, y1, x2, y2] = r.bbox;
                        Detection::from_xyxy(x1, y1, x2, y2, r.confidence, r.class_id)
                    })
                    .collect();
                (f.frame, dets)
            })
            .collect();
        Self { frames, next_frame: 1 }
    }

    /// Load a JSON array of [`FrameDetections`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading detections {}", path.display()))?;
        let frames: Vec<FrameDetections> =
            serde_json::from_str(&data).with_context(|| format!("parsing detections {}", path.display()))?;
        Ok(Self::new(frames))
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl<F> Detector<F> for ReplayDetector {
    fn detect(&mut self, _frame: &F) -> Result<Vec<Detection>> {
        let dets = self.frames.get(&self.next_frame).cloned().unwrap_or_default();
        self.next_frame += 1;
        Ok(dets)
    }

    fn reset(&mut self) {
        self.next_frame = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle_filter() -> DetectionFilter {
        DetectionFilter::from_config(&ClassConfig::default()).unwrap()
    }

    #[test]
    fn test_filter_keeps_vehicles_above_floor() {
        let filter = vehicle_filter();
        let car = Detection::from_xyxy(10.0, 10.0, 50.0, 40.0, 0.8, 2);
        let person = Detection::from_xyxy(10.0, 10.0, 50.0, 40.0, 0.9, 0);
        let faint_truck = Detection::from_xyxy(10.0, 10.0, 50.0, 40.0, 0.3, 7);

        assert!(filter.allows(&car));
        assert!(!filter.allows(&person));
        // floor is exclusive
        assert!(!filter.allows(&faint_truck));

        let kept = filter.apply(vec![car.clone(), person, faint_truck]);
        assert_eq!(kept, vec![car]);
    }

    #[test]
    fn test_filter_rejects_inverted_box() {
        let filter = vehicle_filter();
        let det = Detection::from_xyxy(50.0, 10.0, 10.0, 40.0, 0.9, 2);
        assert!(!filter.allows(&det));
    }

    #[test]
    fn test_unknown_allowed_class_is_config_error() {
        let mut classes = ClassConfig::default();
        classes.allowed.push("hovercraft".to_string());
        let err = DetectionFilter::from_config(&classes).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownClass(ref l) if l == "hovercraft"));
    }

    #[test]
    fn test_replay_detector_walks_frames() {
        let json = r#"[
            {"frame": 1, "detections": [{"bbox": [0, 0, 10, 10], "confidence": 0.9, "class_id": 2}]},
            {"frame": 3, "detections": [{"bbox": [5, 5, 15, 15], "confidence": 0.7, "class_id": 7}]}
        ]"#;
        let frames: Vec<FrameDetections> = serde_json::from_str(json).unwrap();
        let mut replay = ReplayDetector::new(frames);
        assert_eq!(replay.frame_count(), 2);

        let first = Detector::<()>::detect(&mut replay, &()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].class_id, 2);
        assert!(Detector::<()>::detect(&mut replay, &()).unwrap().is_empty());
        let third = Detector::<()>::detect(&mut replay, &()).unwrap();
        assert_eq!(third[0].tlbr, SVector::<f32, 4>::new(5.0, 5.0, 15.0, 15.0));

        Detector::<()>::reset(&mut replay);
        assert_eq!(Detector::<()>::detect(&mut replay, &()).unwrap().len(), 1);
    }
}
