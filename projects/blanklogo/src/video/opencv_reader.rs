use super::{VideoInfo, VideoReader, DEFAULT_FPS};
use anyhow::{anyhow, Context, Result};
use opencv::{
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH,
    },
};
use std::path::Path;

/// Sequential video reader backed by OpenCV's VideoCapture.
pub struct OpencvReader {
    capture: VideoCapture,
    info: VideoInfo,
}

impl OpencvReader {
    pub fn new(path: &Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Video path is not valid UTF-8: {:?}", path))?;

        let capture = VideoCapture::from_file(path_str, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path_str));
        }

        let mut fps = capture.get(CAP_PROP_FPS)?;
        if fps <= 0.0 {
            tracing::warn!(
                "OpencvReader: Failed to get FPS from metadata, falling back to {}",
                DEFAULT_FPS
            );
            fps = DEFAULT_FPS;
        }
        let frame_count = capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;
        let width = capture.get(CAP_PROP_FRAME_WIDTH)? as u32;
        let height = capture.get(CAP_PROP_FRAME_HEIGHT)? as u32;

        // VideoCapture does not expose audio streams; ask the container.
        let has_audio = super::probe(path)
            .map(|info| info.has_audio)
            .context("Failed to probe audio streams")?;

        tracing::info!(
            "OpencvReader: opened {}, {}x{}, fps={:.2}, stream_frames={}, audio={}",
            path_str,
            width,
            height,
            fps,
            frame_count,
            has_audio
        );

        Ok(Self {
            capture,
            info: VideoInfo {
                width,
                height,
                fps,
                frame_count,
                has_audio,
            },
        })
    }
}

impl VideoReader for OpencvReader {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}
