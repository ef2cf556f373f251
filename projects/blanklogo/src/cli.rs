use anyhow::Result;
use blanklogo::options::InferenceDevice;
use blanklogo::video::DecoderBackend;
use blanklogo::{CropEdge, ModelConfig, PipelineError, ProcessOptions, ProcessingMode};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub models: ModelArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[derive(clap::Args, Debug)]
pub struct ModelArgs {
    /// RT-DETR watermark detector model (ONNX)
    #[arg(long, global = true, env = "BLANKLOGO_DETECTOR_MODEL")]
    pub detector_model: Option<PathBuf>,

    /// Inpainting model (ONNX); the OpenCV fallback is used without it
    #[arg(long, global = true, env = "BLANKLOGO_INPAINT_MODEL")]
    pub inpaint_model: Option<PathBuf>,

    /// Inference device for the inpainting model
    #[arg(long, global = true, value_enum, default_value_t = InferenceDevice::Auto, env = "BLANKLOGO_DEVICE")]
    pub device: InferenceDevice,
}

impl ModelArgs {
    pub fn config(&self) -> ModelConfig {
        ModelConfig {
            detector_model: self.detector_model.clone(),
            inpaint_model: self.inpaint_model.clone(),
            device: self.device,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Remove the watermark from one video
    Process(ProcessArgs),
    /// Print supported modes and model status as JSON
    Capabilities,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Crop,
    Inpaint,
    Auto,
}

#[derive(clap::Args, Debug)]
pub struct ProcessArgs {
    /// Input video
    pub input: PathBuf,

    /// Output video
    pub output: PathBuf,

    #[arg(long, value_enum, default_value_t = ModeArg::Inpaint, env = "BLANKLOGO_MODE")]
    pub mode: ModeArg,

    /// Pixels to remove (crop mode)
    #[arg(long)]
    pub crop_pixels: Option<u32>,

    /// Edge to remove (crop mode)
    #[arg(long, value_enum, default_value_t = CropEdge::Bottom)]
    pub crop_position: CropEdge,

    /// JSON file with processing options; flags below override it
    #[arg(long, env = "BLANKLOGO_OPTIONS")]
    pub options: Option<PathBuf>,

    #[arg(long)]
    pub job_id: Option<String>,

    /// Margin around each detected box, in pixels
    #[arg(long, env = "BLANKLOGO_MASK_PADDING")]
    pub mask_padding: Option<i32>,

    #[arg(long)]
    pub stride: Option<i32>,

    #[arg(long, env = "BLANKLOGO_CONFIDENCE_THRESHOLD")]
    pub confidence_threshold: Option<f32>,

    #[arg(long, env = "BLANKLOGO_CRF")]
    pub crf: Option<u8>,

    #[arg(long, env = "BLANKLOGO_PRESET")]
    pub preset: Option<String>,

    #[arg(long, value_enum, env = "BLANKLOGO_DECODER")]
    pub decoder: Option<DecoderBackend>,

    /// Disable edge blending in the fallback inpainter
    #[arg(long)]
    pub no_edge_blend: bool,

    /// Write the result and job summary here as JSON
    #[arg(long)]
    pub summary_json: Option<PathBuf>,

    /// Write the final per-frame detections here as JSON
    #[arg(long)]
    pub detections_json: Option<PathBuf>,
}

impl ProcessArgs {
    pub fn mode(&self) -> Result<ProcessingMode, PipelineError> {
        match self.mode {
            ModeArg::Crop => {
                let pixels = self
                    .crop_pixels
                    .ok_or_else(|| PipelineError::InvalidModeOptions {
                        details: "crop mode requires --crop-pixels".to_string(),
                    })?;
                ProcessingMode::crop(pixels, self.crop_position)
            }
            ModeArg::Inpaint => Ok(ProcessingMode::Inpaint),
            ModeArg::Auto => Ok(ProcessingMode::Auto),
        }
    }

    pub fn options(&self) -> Result<ProcessOptions> {
        let mut options = match &self.options {
            Some(path) => ProcessOptions::from_json_file(path)?,
            None => ProcessOptions::default(),
        };
        if let Some(job_id) = &self.job_id {
            options.job_id = Some(job_id.clone());
        }
        if let Some(v) = self.mask_padding {
            options.mask_padding = v;
        }
        if let Some(v) = self.stride {
            options.stride = v;
        }
        if let Some(v) = self.confidence_threshold {
            options.confidence_threshold = v;
        }
        if let Some(v) = self.crf {
            options.crf = v;
        }
        if let Some(v) = &self.preset {
            options.preset = v.clone();
        }
        if let Some(v) = self.decoder {
            options.decoder = v;
        }
        if self.no_edge_blend {
            options.fallback.edge_blend = false;
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_flags_parse_into_mode() {
        let args = Args::try_parse_from([
            "blanklogo",
            "process",
            "in.mp4",
            "out.mp4",
            "--mode",
            "crop",
            "--crop-pixels",
            "100",
            "--crop-position",
            "top",
        ])
        .unwrap();
        let Command::Process(p) = args.command else {
            panic!("expected process");
        };
        assert_eq!(
            p.mode().unwrap(),
            ProcessingMode::Crop {
                pixels: 100,
                edge: CropEdge::Top
            }
        );
    }

    #[test]
    fn test_crop_without_pixels_is_invalid() {
        let args =
            Args::try_parse_from(["blanklogo", "process", "a.mp4", "b.mp4", "--mode", "crop"]).unwrap();
        let Command::Process(p) = args.command else {
            panic!("expected process");
        };
        assert!(matches!(
            p.mode(),
            Err(PipelineError::InvalidModeOptions { .. })
        ));
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "blanklogo",
            "process",
            "a.mp4",
            "b.mp4",
            "--mask-padding",
            "5",
            "--crf",
            "23",
            "--no-edge-blend",
        ])
        .unwrap();
        let Command::Process(p) = args.command else {
            panic!("expected process");
        };
        let opts = p.options().unwrap();
        assert_eq!(opts.mask_padding, 5);
        assert_eq!(opts.crf, 23);
        assert!(!opts.fallback.edge_blend);
        assert_eq!(opts.stride, 8);
        assert_eq!(p.mode().unwrap(), ProcessingMode::Inpaint);
    }
}
