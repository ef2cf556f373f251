use crate::pipeline::types::{BBox, Detection};
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use std::path::Path;
use usls::models::RTDETR;
use usls::{Config, Image};

/// Highest-confidence watermark candidate in a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: BBox,
    pub confidence: f32,
}

/// Watermark detection capability: frame -> best candidate.
pub trait WatermarkDetector: Send {
    fn detect(&mut self, frame: &Mat) -> Result<Option<Candidate>>;
}

/// Turn the detector's best candidate into a per-frame record.
/// Candidates under `threshold` count as not detected but keep their score.
pub fn classify(candidate: Option<Candidate>, threshold: f32) -> Detection {
    match candidate {
        None => Detection::missing(),
        Some(c) if c.confidence < threshold => Detection::rejected(c.confidence),
        Some(c) => Detection::observed(c.bbox, c.confidence),
    }
}

/// RT-DETR watermark detector running through usls.
///
/// Handles BGR-to-RGB conversion and corrects for the aspect-ratio padding
/// bug in the underlying model library.
pub struct RtDetrDetector {
    model: RTDETR,
}

impl RtDetrDetector {
    pub fn new(model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(anyhow!("Detector model not found: {:?}", model_path));
        }
        let model_file = model_path
            .to_str()
            .ok_or_else(|| anyhow!("Detector model path is not valid UTF-8: {:?}", model_path))?;

        let config = Config::default()
            .with_model_file(model_file)
            .with_class_names(&["watermark"]);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        tracing::info!("Loaded watermark detector from {:?}", model_path);
        Ok(Self { model })
    }
}

impl WatermarkDetector for RtDetrDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Option<Candidate>> {
        let size = frame.size()?;
        let img_w = size.width as f32;
        let img_h = size.height as f32;

        // usls RT-DETR scales boxes as if the input were square.
        let (x_corr, y_corr) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let image = Image::from(mat_to_dynamic_image(frame)?);
        let results = self.model.forward(&[image])?;
        let Some(y) = results.into_iter().next() else {
            return Ok(None);
        };

        let best = y
            .hbbs
            .iter()
            .filter_map(|hbb| {
                let x1 = hbb.xmin() * x_corr;
                let y1 = hbb.ymin() * y_corr;
                let x2 = x1 + hbb.width() * x_corr;
                let y2 = y1 + hbb.height() * y_corr;
                let bbox = BBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32)?;
                Some(Candidate {
                    bbox,
                    confidence: hbb.confidence().unwrap_or(0.0),
                })
            })
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        Ok(best)
    }
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    let width = size.width as u32;
    let height = size.height as u32;

    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();
    let img_buffer = ImageBuffer::<Rgb<u8>, _>::from_vec(width, height, buffer)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    fn candidate(confidence: f32) -> Candidate {
        Candidate {
            bbox: BBox::new(10, 10, 50, 30).unwrap(),
            confidence,
        }
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(None, 0.5), Detection::missing());

        let low = classify(Some(candidate(0.49)), 0.5);
        assert!(!low.detected);
        assert_eq!(low.confidence, Some(0.49));
        assert!(low.bbox.is_none());

        let ok = classify(Some(candidate(0.5)), 0.5);
        assert!(ok.detected);
        assert_eq!(ok.bbox, BBox::new(10, 10, 50, 30));
        assert!(!ok.interpolated);
    }

    #[test]
    fn test_mat_to_dynamic_image_swaps_channels() {
        // BGR (255, 0, 0) is pure blue.
        let mat = Mat::new_rows_cols_with_default(4, 6, CV_8UC3, Scalar::new(255.0, 0.0, 0.0, 0.0))
            .unwrap();
        let img = mat_to_dynamic_image(&mat).unwrap().to_rgb8();
        assert_eq!(img.width(), 6);
        assert_eq!(img.height(), 4);
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 255]);
    }

    #[test]
    fn test_missing_model_file_is_an_error() {
        assert!(RtDetrDetector::new(Path::new("/nonexistent/watermark.onnx")).is_err());
    }
}
