//! OpenCV-backed frames, masks and video sources.

use anyhow::Context;
use num_traits::ToPrimitive;
use opencv::{
    core::{self, Mat},
    imgcodecs, imgproc,
    prelude::*,
    videoio::{self, VideoCapture, CAP_ANY},
};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::frame::{Frame, FrameSize, FrameSource, Overlay};
use crate::visualization;

fn mat_size(mat: &Mat) -> FrameSize {
    FrameSize::new(mat.cols().to_u32().unwrap_or(0), mat.rows().to_u32().unwrap_or(0))
}

/// Single-channel mask with every pixel either 0 or 255.
#[derive(Debug)]
pub struct BinaryMask {
    mat: Mat,
}

impl BinaryMask {
    /// Read a mask image. Colour images are converted to grey and every
    /// non-zero pixel becomes 255.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let unreadable = || ConfigError::MaskUnreadable { path: path.to_string() };
        let img = imgcodecs::imread(path, imgcodecs::IMREAD_UNCHANGED).map_err(|_| unreadable())?;
        if img.empty() {
            return Err(unreadable());
        }
        let mask = Self::from_mat(&img).map_err(|e| {
            debug!("mask conversion failed: {e}");
            unreadable()
        })?;
        debug!(path, size = %mask.size(), "mask loaded");
        Ok(mask)
    }

    pub fn from_mat(img: &Mat) -> opencv::Result<Self> {
        let gray = match img.channels() {
            1 => img.clone(),
            4 => {
                let mut gray = Mat::default();
                imgproc::cvt_color_def(img, &mut gray, imgproc::COLOR_BGRA2GRAY)?;
                gray
            }
            _ => {
                let mut gray = Mat::default();
                imgproc::cvt_color_def(img, &mut gray, imgproc::COLOR_BGR2GRAY)?;
                gray
            }
        };
        let mut mat = Mat::default();
        imgproc::threshold(&gray, &mut mat, 0.0, 255.0, imgproc::THRESH_BINARY)?;
        Ok(BinaryMask { mat })
    }

    pub fn size(&self) -> FrameSize {
        mat_size(&self.mat)
    }

    pub fn as_mat(&self) -> &Mat {
        &self.mat
    }
}

impl Frame for Mat {
    type Mask = BinaryMask;

    fn size(&self) -> FrameSize {
        mat_size(self)
    }

    fn mask_size(mask: &BinaryMask) -> FrameSize {
        mask.size()
    }

    fn apply_mask(&self, mask: &BinaryMask) -> anyhow::Result<Self> {
        let mut out = Mat::default();
        core::bitwise_and(self, self, &mut out, &mask.mat)?;
        Ok(out)
    }

    fn annotate(&mut self, overlay: &Overlay) -> anyhow::Result<()> {
        visualization::draw_overlay(self, overlay)?;
        Ok(())
    }
}

/// Video file (or anything else `VideoCapture` opens) read frame by frame.
pub struct VideoFileSource {
    cap: VideoCapture,
    path: String,
    size: FrameSize,
    fps: f64,
}

impl VideoFileSource {
    pub fn open(path: &str) -> Result<Self, ConfigError> {
        let open_err = || ConfigError::SourceOpen { path: path.to_string() };
        let cap = VideoCapture::from_file(path, CAP_ANY).map_err(|_| open_err())?;
        if !cap.is_opened().unwrap_or(false) {
            return Err(open_err());
        }

        let prop = |id: i32| cap.get(id).unwrap_or(0.0);
        let size = FrameSize::new(
            prop(videoio::CAP_PROP_FRAME_WIDTH).to_u32().unwrap_or(0),
            prop(videoio::CAP_PROP_FRAME_HEIGHT).to_u32().unwrap_or(0),
        );
        let fps = prop(videoio::CAP_PROP_FPS);
        info!(path, %size, fps, "video opened");

        Ok(VideoFileSource {
            cap,
            path: path.to_string(),
            size,
            fps,
        })
    }

    /// Reported frame rate; `0.0` when the container does not say.
    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FrameSource for VideoFileSource {
    type Frame = Mat;

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn read(&mut self) -> anyhow::Result<Option<Mat>> {
        let mut frame = Mat::default();
        let ok = self
            .cap
            .read(&mut frame)
            .with_context(|| format!("decoding {}", self.path))?;
        if !ok || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn release(&mut self) {
        match self.cap.release() {
            Ok(()) => debug!(path = %self.path, "video released"),
            Err(e) => warn!(path = %self.path, "releasing video failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting::Point;
    use opencv::core::{Scalar, Vec3b, CV_8UC1, CV_8UC3};

    #[test]
    fn test_colour_mask_is_binarised() {
        let mut img = Mat::new_rows_cols_with_default(4, 6, CV_8UC3, Scalar::all(0.0)).unwrap();
        *img.at_2d_mut::<Vec3b>(1, 2).unwrap() = Vec3b::from([0, 0, 40]);

        let mask = BinaryMask::from_mat(&img).unwrap();
        assert_eq!(mask.size(), FrameSize::new(6, 4));
        assert_eq!(mask.as_mat().channels(), 1);
        assert_eq!(*mask.as_mat().at_2d::<u8>(1, 2).unwrap(), 255);
        assert_eq!(*mask.as_mat().at_2d::<u8>(0, 0).unwrap(), 0);
    }

    #[test]
    fn test_apply_mask_blacks_out_region() {
        let frame = Mat::new_rows_cols_with_default(4, 4, CV_8UC3, Scalar::all(200.0)).unwrap();
        let mut raw = Mat::new_rows_cols_with_default(4, 4, CV_8UC1, Scalar::all(0.0)).unwrap();
        *raw.at_2d_mut::<u8>(0, 0).unwrap() = 255;
        let mask = BinaryMask::from_mat(&raw).unwrap();

        let masked = frame.apply_mask(&mask).unwrap();
        assert_eq!(masked.at_2d::<Vec3b>(0, 0).unwrap()[0], 200);
        assert_eq!(masked.at_2d::<Vec3b>(3, 3).unwrap()[0], 0);
    }

    #[test]
    fn test_annotate_draws_line() {
        let mut frame = Mat::new_rows_cols_with_default(400, 800, CV_8UC3, Scalar::all(0.0)).unwrap();
        let overlay = Overlay {
            line_start: Point::new(400, 297),
            line_end: Point::new(673, 297),
            flash: false,
            count: 0,
            tracks: Vec::new(),
        };
        frame.annotate(&overlay).unwrap();
        // BGR red
        assert_eq!(*frame.at_2d::<Vec3b>(297, 500).unwrap(), Vec3b::from([0, 0, 255]));
    }

    #[test]
    fn test_missing_video_is_open_error() {
        let err = VideoFileSource::open("/nonexistent/traffic.mp4").err().unwrap();
        assert!(matches!(err, ConfigError::SourceOpen { .. }));
    }

    #[test]
    fn test_missing_mask_is_unreadable() {
        let err = BinaryMask::from_file("/nonexistent/mask.png").unwrap_err();
        assert!(matches!(err, ConfigError::MaskUnreadable { .. }));
    }
}
