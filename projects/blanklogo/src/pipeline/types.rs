use crate::error::{PipelineError, Warning};
use crate::pipeline::inpaint::InpaintBackendKind;
use crate::pipeline::status::JobSummary;
use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel-space bounding box with exclusive right/bottom edges (x1 < x2, y1 < y2)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    /// Returns `None` for degenerate boxes.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        if x1 < x2 && y1 < y2 {
            Some(Self { x1, y1, x2, y2 })
        } else {
            None
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }
}

/// Per-frame detection record
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub detected: bool,
    pub bbox: Option<BBox>,
    pub confidence: Option<f32>,
    /// Set when the bbox was copied from a neighboring frame.
    pub interpolated: bool,
}

impl Detection {
    pub fn missing() -> Self {
        Self {
            detected: false,
            bbox: None,
            confidence: None,
            interpolated: false,
        }
    }

    pub fn observed(bbox: BBox, confidence: f32) -> Self {
        Self {
            detected: true,
            bbox: Some(bbox),
            confidence: Some(confidence),
            interpolated: false,
        }
    }

    /// A candidate was found but scored under the threshold.
    pub fn rejected(confidence: f32) -> Self {
        Self {
            confidence: Some(confidence),
            ..Self::missing()
        }
    }

    /// Directly observed by the detector (not filled from a neighbor).
    pub fn is_direct(&self) -> bool {
        self.detected && !self.interpolated && self.bbox.is_some()
    }

    /// The region to inpaint, if any.
    pub fn region(&self) -> Option<BBox> {
        if self.detected {
            self.bbox
        } else {
            None
        }
    }
}

/// A decoded frame in BGR24
pub struct Frame {
    pub index: usize,
    pub image: Mat,
}

/// Edge removed by crop mode
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CropEdge {
    Top,
    #[default]
    Bottom,
    Left,
    Right,
}

impl CropEdge {
    pub fn as_str(&self) -> &'static str {
        match self {
            CropEdge::Top => "top",
            CropEdge::Bottom => "bottom",
            CropEdge::Left => "left",
            CropEdge::Right => "right",
        }
    }

    pub const ALL: [CropEdge; 4] = [
        CropEdge::Top,
        CropEdge::Bottom,
        CropEdge::Left,
        CropEdge::Right,
    ];
}

impl fmt::Display for CropEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CropEdge {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "top" => Ok(CropEdge::Top),
            "bottom" => Ok(CropEdge::Bottom),
            "left" => Ok(CropEdge::Left),
            "right" => Ok(CropEdge::Right),
            other => Err(PipelineError::InvalidModeOptions {
                details: format!("unknown crop position '{}'", other),
            }),
        }
    }
}

/// Processing strategy for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Cut `pixels` off one edge; no decode.
    Crop { pixels: u32, edge: CropEdge },
    /// Detect, gap-fill and inpaint every frame.
    Inpaint,
    /// Same pipeline as `Inpaint`; the watermark position is always located per frame.
    Auto,
}

impl ProcessingMode {
    pub fn crop(pixels: u32, edge: CropEdge) -> Result<Self, PipelineError> {
        if pixels == 0 {
            return Err(PipelineError::InvalidModeOptions {
                details: "crop amount must be at least 1 pixel".to_string(),
            });
        }
        Ok(ProcessingMode::Crop { pixels, edge })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessingMode::Crop { .. } => "crop",
            ProcessingMode::Inpaint => "inpaint",
            ProcessingMode::Auto => "auto",
        }
    }

    pub const NAMES: [&'static str; 3] = ["crop", "inpaint", "auto"];
}

/// Outcome of a completed run. Same shape for every mode; mode-specific
/// fields stay `None` when they do not apply.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub job_id: String,
    pub mode: String,
    /// Frames decoded and re-encoded (inpaint/auto).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_processed: Option<usize>,
    /// Frames with a watermark region after gap-filling (inpaint/auto).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermarks_detected: Option<usize>,
    /// Of those, frames whose region was copied from a neighbor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpolated_frames: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inpaint_backend: Option<InpaintBackendKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_pixels: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_position: Option<CropEdge>,
    pub original_size: (u32, u32),
    pub output_size: (u32, u32),
    pub elapsed_secs: f64,
    pub frames_per_sec: f64,
    pub warnings: Vec<Warning>,
    pub summary: JobSummary,
    /// Final per-frame detections (inpaint/auto); dumped separately by the CLI.
    #[serde(skip)]
    pub detections: Vec<Detection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_rejects_degenerate() {
        assert!(BBox::new(10, 10, 10, 20).is_none());
        assert!(BBox::new(10, 20, 30, 5).is_none());
        let b = BBox::new(1, 2, 11, 7).unwrap();
        assert_eq!(b.width(), 10);
        assert_eq!(b.height(), 5);
        assert_eq!(b.area(), 50);
    }

    #[test]
    fn test_rejected_detection_keeps_confidence() {
        let d = Detection::rejected(0.3);
        assert!(!d.detected);
        assert_eq!(d.confidence, Some(0.3));
        assert!(d.region().is_none());
        assert!(!d.is_direct());
    }

    #[test]
    fn test_crop_mode_validation() {
        assert!(ProcessingMode::crop(0, CropEdge::Bottom).is_err());
        let mode = ProcessingMode::crop(100, CropEdge::Left).unwrap();
        assert_eq!(mode.name(), "crop");
        assert_eq!(
            mode,
            ProcessingMode::Crop {
                pixels: 100,
                edge: CropEdge::Left
            }
        );
    }

    #[test]
    fn test_crop_edge_parsing() {
        assert_eq!("Top".parse::<CropEdge>().unwrap(), CropEdge::Top);
        assert_eq!("right".parse::<CropEdge>().unwrap(), CropEdge::Right);
        assert!(matches!(
            "middle".parse::<CropEdge>(),
            Err(PipelineError::InvalidModeOptions { .. })
        ));
    }
}
