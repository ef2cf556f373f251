use crate::error::PipelineError;
use crate::pipeline::types::CropEdge;
use crate::video::writer::run_ffmpeg;
use anyhow::Result;
use std::path::Path;
use std::process::Command;

/// Region kept by crop mode, in source pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl CropRect {
    /// ffmpeg `crop` filter expression.
    pub fn filter(&self) -> String {
        format!("crop={}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

/// Remove `pixels` from one edge of a `width` x `height` frame.
pub fn compute_crop(
    width: u32,
    height: u32,
    pixels: u32,
    edge: CropEdge,
) -> Result<CropRect, PipelineError> {
    let span = match edge {
        CropEdge::Top | CropEdge::Bottom => height,
        CropEdge::Left | CropEdge::Right => width,
    };
    if pixels == 0 || pixels >= span {
        return Err(PipelineError::InvalidModeOptions {
            details: format!(
                "cannot crop {} px from the {} edge of a {}x{} video",
                pixels, edge, width, height
            ),
        });
    }

    let rect = match edge {
        CropEdge::Bottom => CropRect {
            width,
            height: height - pixels,
            x: 0,
            y: 0,
        },
        CropEdge::Top => CropRect {
            width,
            height: height - pixels,
            x: 0,
            y: pixels,
        },
        CropEdge::Left => CropRect {
            width: width - pixels,
            height,
            x: pixels,
            y: 0,
        },
        CropEdge::Right => CropRect {
            width: width - pixels,
            height,
            x: 0,
            y: 0,
        },
    };
    Ok(rect)
}

/// Crop `input` into `output` in one ffmpeg pass, copying audio untouched.
pub fn run_crop(input: &Path, output: &Path, rect: &CropRect) -> Result<()> {
    tracing::info!("Cropping {:?} with {} -> {:?}", input, rect.filter(), output);
    let mut cmd = crop_command(input, output, rect);
    run_ffmpeg(&mut cmd)
}

fn crop_command(input: &Path, output: &Path, rect: &CropRect) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-hide_banner", "-loglevel", "error"])
        .arg("-i")
        .arg(input)
        .args(["-vf", &rect.filter()])
        .args(["-c:a", "copy", "-movflags", "+faststart"])
        .arg(output);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bottom_crop_full_hd() {
        let rect = compute_crop(1920, 1080, 100, CropEdge::Bottom).unwrap();
        assert_eq!(
            rect,
            CropRect {
                width: 1920,
                height: 980,
                x: 0,
                y: 0
            }
        );
        assert_eq!(rect.filter(), "crop=1920:980:0:0");
    }

    #[test]
    fn test_each_edge_offsets() {
        assert_eq!(compute_crop(640, 480, 40, CropEdge::Top).unwrap().filter(), "crop=640:440:0:40");
        assert_eq!(compute_crop(640, 480, 40, CropEdge::Left).unwrap().filter(), "crop=600:480:40:0");
        assert_eq!(compute_crop(640, 480, 40, CropEdge::Right).unwrap().filter(), "crop=600:480:0:0");
    }

    #[test]
    fn test_crop_larger_than_frame_is_rejected() {
        assert!(matches!(
            compute_crop(640, 480, 480, CropEdge::Bottom),
            Err(PipelineError::InvalidModeOptions { .. })
        ));
        assert!(compute_crop(640, 480, 479, CropEdge::Bottom).is_ok());
        assert!(compute_crop(640, 480, 700, CropEdge::Left).is_err());
        assert!(compute_crop(640, 480, 0, CropEdge::Top).is_err());
    }

    #[test]
    fn test_crop_command_copies_audio() {
        let rect = compute_crop(1280, 720, 60, CropEdge::Top).unwrap();
        let cmd = crop_command(Path::new("in.mov"), Path::new("out.mov"), &rect);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-vf crop=1280:660:0:60"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("-movflags +faststart"));
    }
}
