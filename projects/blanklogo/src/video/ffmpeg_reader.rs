use super::{VideoInfo, VideoReader};
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use opencv::{core, prelude::*};
use std::path::Path;

/// Sequential video reader backed by FFmpeg via ffmpeg-next.
/// Every frame is converted to a BGR24 OpenCV Mat.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    info: VideoInfo,
    packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
    finished: bool,
}

// SAFETY: an FfmpegReader is owned by a single run and only touched from the
// thread driving that run; the raw pointers inside are never shared.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &Path) -> Result<Self> {
        let input_ctx = super::open_input(path)?;
        let (info, video_stream_index) =
            super::stream_info(&input_ctx).with_context(|| format!("Failed to read {:?}", path))?;

        let video_stream = input_ctx
            .stream(video_stream_index)
            .ok_or_else(|| anyhow!("Video stream {} disappeared", video_stream_index))?;
        let decoder = ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
            .context("Failed to create decoder context")?
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let duration_secs = input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64;
        tracing::info!(
            "FfmpegReader: opened {:?}, {}x{}, duration={:.2}s, fps={:.2}, estimated_frames={}, audio={}",
            path,
            info.width,
            info.height,
            duration_secs,
            info.fps,
            info.frame_count,
            info.has_audio
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            info,
            packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
            finished: false,
        })
    }

    /// Pull the next decoded frame into `target`. Returns `false` at end of stream.
    fn decode_next(&mut self, target: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            // Feed packets until one belongs to the video stream, or flush at EOF.
            let mut fed = false;
            while self.packet.read(&mut self.input_ctx).is_ok() {
                if self.packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.packet)
                        .context("Failed to send packet to decoder")?;
                    fed = true;
                    break;
                }
            }
            if !fed {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn to_bgr(
        &mut self,
        frame: &ffmpeg_next::util::frame::Video,
    ) -> Result<ffmpeg_next::util::frame::Video> {
        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg_next::format::Pixel::BGR24,
                self.info.width,
                self.info.height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| anyhow!("Scaler not initialized"))?;

        let mut bgr = ffmpeg_next::util::frame::Video::empty();
        scaler.run(frame, &mut bgr).context("Scaler failed")?;
        Ok(bgr)
    }
}

/// Deep-copy a BGR24 ffmpeg frame into an owned OpenCV Mat, dropping row padding.
fn bgr_frame_to_mat(frame: &ffmpeg_next::util::frame::Video) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let row_bytes = width as usize * 3;
    let data = frame.data(0);
    let stride = frame.stride(0);

    let mut mat =
        core::Mat::new_rows_cols_with_default(height, width, core::CV_8UC3, core::Scalar::all(0.0))?;
    let dst = mat.data_bytes_mut()?;
    for y in 0..height as usize {
        let src_row = &data[y * stride..y * stride + row_bytes];
        dst[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(src_row);
    }

    Ok(mat)
}

impl VideoReader for FfmpegReader {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<core::Mat>> {
        if self.finished {
            return Ok(None);
        }
        let mut raw = ffmpeg_next::util::frame::Video::empty();
        if !self.decode_next(&mut raw)? {
            self.finished = true;
            return Ok(None);
        }
        let bgr = self.to_bgr(&raw)?;
        Ok(Some(bgr_frame_to_mat(&bgr)?))
    }
}
