//! TorchScript YOLO detector (feature `torch`).

use anyhow::{bail, Result};
use num_traits::ToPrimitive;
use opencv::{
    core::{Mat, Size, CV_32F},
    imgproc,
    prelude::*,
};
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use crate::detection::{Detection, Detector};
use crate::utils;

/// Wraps a TorchScript export of a COCO YOLO model.
///
/// Accepted output layouts:
/// - `[1, N, 6]`: `x1, y1, x2, y2, conf, class` (export with NMS baked in)
/// - `[1, N, 85]`: YOLOv5/v7 raw, `cx, cy, w, h, obj, 80 class scores`
/// - `[1, 84, N]`: YOLOv8 raw, `cx, cy, w, h, 80 class scores` per column
pub struct TorchDetector {
    model: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    pub conf_threshold: f32,
    pub nms_threshold: f32,
}

impl TorchDetector {
    /// Load a model for `device` ("cpu" / "cuda").
    pub fn new(model_path: &str, device: &str, input_size: (i64, i64)) -> Result<Self> {
        let device = if device == "cuda" && tch::Cuda::is_available() {
            Device::Cuda(0)
        } else {
            Device::Cpu
        };
        let mut model = tch::CModule::load_on_device(model_path, device)?;
        model.set_eval();
        info!(model_path, ?device, "torchscript model loaded");

        Ok(TorchDetector {
            model,
            device,
            input_size,
            conf_threshold: 0.25,
            nms_threshold: 0.45,
        })
    }

    /// Resize, BGR → RGB, scale to `[0, 1]`, HWC → NCHW.
    fn preprocess(&self, frame: &Mat) -> Result<Tensor> {
        let (w, h) = self.input_size;
        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(w.to_i32().unwrap_or(640), h.to_i32().unwrap_or(640)),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&resized, &mut rgb, imgproc::COLOR_BGR2RGB)?;

        let mut float_mat = Mat::default();
        rgb.convert_to(&mut float_mat, CV_32F, 1.0 / 255.0, 0.0)?;
        let flat = float_mat.reshape(1, 0)?;
        let data = flat.data_typed::<f32>()?;

        let tensor = Tensor::from_slice(data)
            .reshape([1, h, w, 3])
            .permute([0, 3, 1, 2])
            .to_kind(Kind::Float)
            .to_device(self.device);
        Ok(tensor)
    }
}

impl Detector<Mat> for TorchDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>> {
        let input = self.preprocess(frame)?;
        let output = tch::no_grad(|| self.model.forward_ts(&[input]))?;

        let scale = (
            frame.cols() as f32 / self.input_size.0 as f32,
            frame.rows() as f32 / self.input_size.1 as f32,
        );
        decode_output(&output, scale, self.conf_threshold, self.nms_threshold)
    }
}

/// Turn raw model output into pixel-space detections, then apply NMS.
/// `scale` maps model input pixels to frame pixels per axis.
pub fn decode_output(output: &Tensor, scale: (f32, f32), conf_threshold: f32, nms_threshold: f32) -> Result<Vec<Detection>> {
    let shape = output.size();
    if shape.len() != 3 || shape[0] != 1 {
        bail!("unsupported output shape {shape:?}");
    }
    let cpu = output.to_device(Device::Cpu).to_kind(Kind::Float).contiguous();
    let values = Vec::<f32>::try_from(&cpu.flatten(0, -1))?;
    let (d1, d2) = (shape[1] as usize, shape[2] as usize);
    let (sx, sy) = scale;

    let mut detections = Vec::new();
    let mut push = |x1: f32, y1: f32, x2: f32, y2: f32, conf: f32, class_id: usize| {
        if conf < conf_threshold {
            return;
        }
        if let Some(class_id) = class_id.to_u32() {
            detections.push(Detection::from_xyxy(x1 * sx, y1 * sy, x2 * sx, y2 * sy, conf, class_id));
        }
    };
    let best_class = |scores: &[f32]| {
        scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, &s)| (i, s))
            .unwrap_or((0, 0.0))
    };

    if d1 == 84 {
        let mut column = vec![0.0f32; 84];
        for j in 0..d2 {
            for (i, v) in column.iter_mut().enumerate() {
                *v = values[i * d2 + j];
            }
            let (class_id, cls_conf) = best_class(&column[4..]);
            let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
            push(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0, cls_conf, class_id);
        }
    } else if d2 == 6 {
        for row in values.chunks_exact(6) {
            let class_id = row[5].max(0.0).round() as usize;
            push(row[0], row[1], row[2], row[3], row[4], class_id);
        }
    } else if d2 == 85 {
        for row in values.chunks_exact(85) {
            let (class_id, cls_conf) = best_class(&row[5..]);
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            push(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0, row[4] * cls_conf, class_id);
        }
    } else {
        bail!("unsupported output shape {shape:?}");
    }

    let total = detections.len();
    if total > 1 {
        let boxes: Vec<_> = detections.iter().map(|d| d.tlbr).collect();
        let scores: Vec<f32> = detections.iter().map(|d| d.confidence).collect();
        let keep = utils::nms(&boxes, &scores, nms_threshold);
        detections = keep.into_iter().map(|i| detections[i].clone()).collect();
    }
    debug!(kept = detections.len(), total, "decoded model output");
    Ok(detections)
}
