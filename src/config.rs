use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

use crate::error::ConfigError;

/// COCO-80 labels in model output order.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorbike", "aeroplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "sofa",
    "pottedplant", "bed", "diningtable", "toilet", "tvmonitor", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub line: LineConfig,
    pub classes: ClassConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Cycles a track may go unmatched before it is lost.
    pub max_age: u32,
    /// Hits needed before a track is confirmed.
    pub min_hits: u32,
    /// Minimum IoU for an assignment to stand.
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 20,
            min_hits: 3,
            iou_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    /// `[x1, y1, x2, y2]`
    pub limits: [i32; 4],
    /// Half-height of the counting band in pixels.
    pub band: i32,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            limits: [400, 297, 673, 297],
            band: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassConfig {
    /// Class id → label, indexed by id.
    pub names: Vec<String>,
    pub allowed: Vec<String>,
    /// Detections must score strictly above this.
    pub confidence_floor: f32,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
            allowed: ["car", "truck", "bus", "motorbike"].iter().map(|s| s.to_string()).collect(),
            confidence_floor: 0.3,
        }
    }
}

impl ClassConfig {
    pub fn id_of(&self, label: &str) -> Option<u32> {
        self.names.iter().position(|n| n == label).and_then(|i| u32::try_from(i).ok())
    }

    pub fn label(&self, class_id: u32) -> Option<&str> {
        self.names.get(class_id as usize).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame events buffered before the worker blocks.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_capacity: 4 }
    }
}

impl Config {
    /// Load from a JSON file. Missing sections take their defaults.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tracker;
        if t.min_hits == 0 {
            return Err(ConfigError::Invalid("tracker.min_hits must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&t.iou_threshold) {
            return Err(ConfigError::Invalid(format!(
                "tracker.iou_threshold {} outside [0, 1]",
                t.iou_threshold
            )));
        }

        let l = &self.line;
        if l.band < 0 {
            return Err(ConfigError::Invalid(format!("line.band {} is negative", l.band)));
        }
        if l.limits[0] >= l.limits[2] {
            warn!(limits = ?l.limits, "counting line start.x >= end.x, nothing will be counted");
        }

        let c = &self.classes;
        if !(0.0..=1.0).contains(&c.confidence_floor) {
            return Err(ConfigError::Invalid(format!(
                "classes.confidence_floor {} outside [0, 1]",
                c.confidence_floor
            )));
        }
        if let Some(label) = c.allowed.iter().find(|l| c.id_of(l).is_none()) {
            return Err(ConfigError::UnknownClass(label.clone()));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid("pipeline.queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_counter_setup() {
        let cfg = Config::default();
        assert_eq!(cfg.tracker.max_age, 20);
        assert_eq!(cfg.tracker.min_hits, 3);
        assert_eq!(cfg.line.limits, [400, 297, 673, 297]);
        assert_eq!(cfg.line.band, 15);
        assert_eq!(cfg.pipeline.queue_capacity, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_class_lookup() {
        let classes = ClassConfig::default();
        assert_eq!(classes.id_of("car"), Some(2));
        assert_eq!(classes.id_of("motorbike"), Some(3));
        assert_eq!(classes.id_of("bus"), Some(5));
        assert_eq!(classes.id_of("truck"), Some(7));
        assert_eq!(classes.label(0), Some("person"));
        assert_eq!(classes.label(80), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"line": {"limits": [0, 100, 640, 100]}}"#).unwrap();
        assert_eq!(cfg.line.limits, [0, 100, 640, 100]);
        assert_eq!(cfg.line.band, 15);
        assert_eq!(cfg.tracker.min_hits, 3);
        assert_eq!(cfg.classes.names.len(), 80);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.tracker.iou_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.pipeline.queue_capacity = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.classes.allowed.push("tank".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownClass(_))));
    }

    #[test]
    fn test_reversed_line_is_only_a_warning() {
        let mut cfg = Config::default();
        cfg.line.limits = [673, 297, 400, 297];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_file("/nonexistent/counter.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
