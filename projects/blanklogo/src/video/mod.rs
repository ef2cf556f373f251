pub mod ffmpeg_reader;
pub mod opencv_reader;
pub mod writer;

use anyhow::{anyhow, Context, Result};
use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Stream metadata for a video input
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Declared or estimated; the decoded count is authoritative.
    pub frame_count: usize,
    pub has_audio: bool,
}

/// Sequential frame source yielding BGR24 frames in presentation order.
pub trait VideoReader: Send {
    fn info(&self) -> &VideoInfo;
    /// `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Mat>>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DecoderBackend {
    #[default]
    Ffmpeg,
    Opencv,
}

pub fn open_reader(path: &Path, backend: DecoderBackend) -> Result<Box<dyn VideoReader>> {
    let reader: Box<dyn VideoReader> = match backend {
        DecoderBackend::Ffmpeg => Box::new(
            ffmpeg_reader::FfmpegReader::new(path)
                .with_context(|| format!("Failed to open video with ffmpeg at: {:?}", path))?,
        ),
        DecoderBackend::Opencv => Box::new(
            opencv_reader::OpencvReader::new(path)
                .with_context(|| format!("Failed to open video at: {:?}", path))?,
        ),
    };
    Ok(reader)
}

pub const DEFAULT_FPS: f64 = 30.0;

/// Frame rate from a stream rational, `None` when undefined.
pub fn rational_fps(numerator: i32, denominator: i32) -> Option<f64> {
    if numerator > 0 && denominator > 0 {
        Some(numerator as f64 / denominator as f64)
    } else {
        None
    }
}

/// Read container metadata without decoding any frame.
pub fn probe(path: &Path) -> Result<VideoInfo> {
    let input_ctx = open_input(path)?;
    let (info, _) = stream_info(&input_ctx)?;
    Ok(info)
}

pub(crate) fn open_input(path: &Path) -> Result<ffmpeg_next::format::context::Input> {
    ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

    if !path.exists() {
        return Err(anyhow!("Video file not found: {:?}", path));
    }
    ffmpeg_next::format::input(&path).context("Failed to open video file")
}

/// Stream metadata and the best video stream's index for an opened container.
pub(crate) fn stream_info(input_ctx: &ffmpeg_next::format::context::Input) -> Result<(VideoInfo, usize)> {
    let video_stream = input_ctx
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| anyhow!("No video stream found"))?;

    let rate = video_stream.avg_frame_rate();
    let fps = rational_fps(rate.numerator(), rate.denominator()).unwrap_or_else(|| {
        tracing::warn!("could not determine FPS, defaulting to {}", DEFAULT_FPS);
        DEFAULT_FPS
    });

    let declared = video_stream.frames().max(0) as usize;
    let frame_count = if declared == 0 {
        let duration_secs = input_ctx.duration() as f64 / ffmpeg_next::ffi::AV_TIME_BASE as f64;
        (duration_secs.max(0.0) * fps).round() as usize
    } else {
        declared
    };

    let decoder = ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
        .context("Failed to read codec parameters")?
        .decoder()
        .video()
        .context("Failed to open video decoder")?;

    let has_audio = input_ctx
        .streams()
        .best(ffmpeg_next::media::Type::Audio)
        .is_some();

    let info = VideoInfo {
        width: decoder.width(),
        height: decoder.height(),
        fps,
        frame_count,
        has_audio,
    };
    Ok((info, video_stream.index()))
}

/// Container extensions the pipeline is exercised against.
pub const SUPPORTED_CONTAINERS: [&str; 4] = ["mp4", "mov", "webm", "avi"];

pub fn is_supported_container(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| SUPPORTED_CONTAINERS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
