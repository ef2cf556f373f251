// Run configuration: per-job processing knobs and model locations.

use crate::pipeline::mask::{DEFAULT_MASK_PADDING, DEFAULT_STRIDE};
use crate::video::DecoderBackend;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings for the deterministic (non-model) inpainting fallback
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FallbackConfig {
    /// Side of the elliptical dilation kernel.
    pub dilation_kernel: i32,
    pub dilation_iterations: i32,
    pub inpaint_radius: f64,
    pub edge_blend: bool,
    /// Weight of the blurred result near mask edges.
    pub blend_weight: f32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            dilation_kernel: 7,
            dilation_iterations: 2,
            inpaint_radius: 7.0,
            edge_blend: true,
            blend_weight: 0.3,
        }
    }
}

/// Options for one `process` call
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProcessOptions {
    /// Caller-supplied job id; generated when absent.
    pub job_id: Option<String>,
    /// Margin (px) added around each detected bbox before masking.
    pub mask_padding: i32,
    /// Dimension multiple for model inpainting input; combined with the model's own requirement.
    pub stride: i32,
    /// Detections scoring below this count as not detected.
    pub confidence_threshold: f32,
    /// Constant-quality target for the re-encode (libx264 CRF).
    pub crf: u8,
    pub preset: String,
    /// Frames buffered between the producer and the encoder writer.
    pub encoder_queue: usize,
    /// Upper bound on frames between progress emissions.
    pub progress_every_frames: usize,
    pub decoder: DecoderBackend,
    pub fallback: FallbackConfig,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            mask_padding: DEFAULT_MASK_PADDING,
            stride: DEFAULT_STRIDE,
            confidence_threshold: 0.5,
            crf: 18,
            preset: "medium".to_string(),
            encoder_queue: 8,
            progress_every_frames: 30,
            decoder: DecoderBackend::Ffmpeg,
            fallback: FallbackConfig::default(),
        }
    }
}

impl ProcessOptions {
    /// Load options from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file {:?}", path))?;
        let options: ProcessOptions = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse options file {:?}", path))?;
        Ok(options)
    }
}

/// Accelerator preference for model inference
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InferenceDevice {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

/// Locations of the detection and inpainting models
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// RT-DETR watermark detector (ONNX).
    pub detector_model: Option<PathBuf>,
    /// LaMa-style inpainting network (ONNX), inputs `image` and `mask`.
    pub inpaint_model: Option<PathBuf>,
    pub device: InferenceDevice,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ProcessOptions::default();
        assert_eq!(opts.mask_padding, 15);
        assert_eq!(opts.stride, 8);
        assert_eq!(opts.confidence_threshold, 0.5);
        assert_eq!(opts.fallback.blend_weight, 0.3);
        assert_eq!(opts.decoder, DecoderBackend::Ffmpeg);
    }

    #[test]
    fn test_partial_json_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        fs::write(
            &path,
            r#"{"mask_padding": 5, "crf": 23, "fallback": {"edge_blend": false}}"#,
        )
        .unwrap();

        let opts = ProcessOptions::from_json_file(&path).unwrap();
        assert_eq!(opts.mask_padding, 5);
        assert_eq!(opts.crf, 23);
        assert_eq!(opts.preset, "medium");
        assert!(!opts.fallback.edge_blend);
        assert_eq!(opts.fallback.inpaint_radius, 7.0);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(ProcessOptions::from_json_file(&path).is_err());
    }
}
