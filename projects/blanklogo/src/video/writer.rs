// Encoder side of the frame store: streams raw BGR frames into an ffmpeg
// process, then attaches the original audio.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use opencv::core::Mat;
use opencv::prelude::*;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

/// Lossy, constant-quality encoder settings
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub crf: u8,
    pub preset: String,
    /// Frames buffered ahead of the encoder before `push` blocks.
    pub queue: usize,
}

/// Run an ffmpeg command to completion, surfacing stderr on failure.
pub fn run_ffmpeg(cmd: &mut Command) -> Result<()> {
    tracing::debug!("Running {:?}", cmd);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .context("Failed to execute ffmpeg; is it installed and on PATH?")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        bail!(
            "ffmpeg exited with {:?}: {}",
            output.status.code(),
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        );
    }
    Ok(())
}

fn raw_encode_command(output: &Path, width: u32, height: u32, fps: f64, settings: &EncodeSettings) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-hide_banner", "-loglevel", "error"])
        .args(["-f", "rawvideo", "-pix_fmt", "bgr24"])
        .args(["-s", &format!("{}x{}", width, height)])
        .args(["-r", &format!("{}", fps)])
        .args(["-i", "pipe:0"])
        .args(["-c:v", "libx264", "-preset", &settings.preset])
        .args(["-crf", &settings.crf.to_string()])
        .args(["-pix_fmt", "yuv420p"])
        .arg(output);
    cmd
}

/// Streaming raw-video encoder.
///
/// Frames pushed here go through a bounded channel to a writer thread that
/// feeds ffmpeg's stdin; `push` blocks while the queue is full.
pub struct FrameEncoder {
    tx: Option<Sender<Mat>>,
    writer: Option<JoinHandle<Result<usize>>>,
    child: Child,
    output: PathBuf,
    stderr_log: PathBuf,
    width: i32,
    height: i32,
}

impl FrameEncoder {
    pub fn start(output: &Path, width: u32, height: u32, fps: f64, settings: &EncodeSettings) -> Result<Self> {
        let cmd = raw_encode_command(output, width, height, fps, settings);
        let encoder = Self::spawn(cmd, output, width, height, settings.queue)?;
        tracing::info!(
            "FrameEncoder: encoding {}x{} @ {:.3} fps to {:?} (crf={}, preset={})",
            width,
            height,
            fps,
            output,
            settings.crf,
            settings.preset
        );
        Ok(encoder)
    }

    /// Start `cmd` with frames on stdin. Its stderr goes to a log file next
    /// to `output` so a chatty encoder can never stall on a full pipe.
    fn spawn(mut cmd: Command, output: &Path, width: u32, height: u32, queue: usize) -> Result<Self> {
        let stderr_log = output.with_extension("log");
        let log = File::create(&stderr_log)
            .with_context(|| format!("Failed to create encoder log {:?}", stderr_log))?;

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .context("Failed to spawn ffmpeg encoder; is it installed and on PATH?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ffmpeg encoder stdin unavailable"))?;

        let (tx, rx) = channel::bounded::<Mat>(queue.max(1));
        let writer = thread::spawn(move || write_worker(rx, stdin));

        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
            child,
            output: output.to_path_buf(),
            stderr_log,
            width: width as i32,
            height: height as i32,
        })
    }

    /// Queue one frame; blocks while the encoder is behind.
    pub fn push(&self, frame: Mat) -> Result<()> {
        if frame.cols() != self.width || frame.rows() != self.height {
            bail!(
                "Frame is {}x{}, encoder expects {}x{}",
                frame.cols(),
                frame.rows(),
                self.width,
                self.height
            );
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("Encoder already closed"))?;
        tx.send(frame)
            .map_err(|_| anyhow!("Encoder writer stopped early"))
    }

    /// Close the stream, wait for the writer to drain and ffmpeg to exit.
    /// Returns the number of frames written.
    pub fn finish(mut self) -> Result<usize> {
        drop(self.tx.take());

        let written = match self.writer.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("Encoder writer thread panicked"))?,
            None => Err(anyhow!("Encoder writer missing")),
        };

        let status = self
            .child
            .wait()
            .context("Failed to wait for ffmpeg encoder")?;

        let written = written?;
        let produced = std::fs::metadata(&self.output)
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        if !produced {
            bail!(
                "ffmpeg produced no output at {:?} (status {:?}): {}",
                self.output,
                status.code(),
                log_tail(&self.stderr_log)
            );
        }
        if !status.success() {
            tracing::warn!(
                "FrameEncoder: ffmpeg exited with {:?} but produced {:?}: {}",
                status.code(),
                self.output,
                log_tail(&self.stderr_log)
            );
        }

        tracing::info!("FrameEncoder: wrote {} frames to {:?}", written, self.output);
        Ok(written)
    }

    /// Stop the encoder without finalizing; the partial file is left for the caller to discard.
    pub fn abort(mut self) {
        drop(self.tx.take());
        if let Err(e) = self.child.kill() {
            tracing::debug!("FrameEncoder: kill failed: {}", e);
        }
        let _ = self.child.wait();
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        tracing::info!("FrameEncoder: aborted {:?}", self.output);
    }
}

/// Last few lines of an encoder log, joined for an error message.
fn log_tail(path: &Path) -> String {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let tail: Vec<&str> = content.lines().rev().take(5).collect();
    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
}

fn write_worker(rx: Receiver<Mat>, mut stdin: ChildStdin) -> Result<usize> {
    let mut written = 0;
    for frame in rx {
        let frame = if frame.is_continuous() {
            frame
        } else {
            frame.try_clone()?
        };
        stdin
            .write_all(frame.data_bytes()?)
            .context("Failed to write frame to ffmpeg")?;
        written += 1;
    }
    stdin.flush().context("Failed to flush ffmpeg stdin")?;
    // Dropping stdin closes the pipe and lets ffmpeg finalize the file.
    Ok(written)
}

/// Combine the video stream of `video` with the first audio stream of
/// `audio_source`, stream-copying video and re-encoding audio to AAC.
pub fn mux_audio(video: &Path, audio_source: &Path, output: &Path) -> Result<()> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-hide_banner", "-loglevel", "error"])
        .arg("-i")
        .arg(video)
        .arg("-i")
        .arg(audio_source)
        .args(["-map", "0:v:0", "-map", "1:a:0"])
        .args(["-c:v", "copy", "-c:a", "aac", "-shortest"])
        .arg(output);
    run_ffmpeg(&mut cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_encode_command_args() {
        let settings = EncodeSettings {
            crf: 18,
            preset: "medium".to_string(),
            queue: 4,
        };
        let cmd = raw_encode_command(Path::new("/tmp/out.mp4"), 640, 360, 29.97, &settings);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt bgr24"));
        assert!(joined.contains("-s 640x360"));
        assert!(joined.contains("-r 29.97"));
        assert!(joined.contains("-i pipe:0"));
        assert!(joined.contains("-crf 18"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    /// Needs the ffmpeg binary on PATH.
    #[test]
    #[ignore]
    fn test_encode_then_decode_keeps_count_and_fps() {
        use crate::video::{open_reader, DecoderBackend};
        use opencv::core::{Scalar, CV_8UC3};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round_trip.mp4");
        let settings = EncodeSettings {
            crf: 18,
            preset: "ultrafast".to_string(),
            queue: 2,
        };

        let encoder = FrameEncoder::start(&path, 64, 48, 25.0, &settings).unwrap();
        for i in 0..12 {
            let shade = (i * 20) as f64;
            let frame =
                Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(shade)).unwrap();
            encoder.push(frame).unwrap();
        }
        assert_eq!(encoder.finish().unwrap(), 12);

        let mut reader = open_reader(&path, DecoderBackend::Ffmpeg).unwrap();
        assert!((reader.info().fps - 25.0).abs() < 0.01);
        assert!(!reader.info().has_audio);
        let mut decoded = 0;
        while reader.next_frame().unwrap().is_some() {
            decoded += 1;
        }
        assert_eq!(decoded, 12);
    }

    #[cfg(unix)]
    #[test]
    fn test_noisy_encoder_stderr_does_not_stall_frames() {
        use opencv::core::{Scalar, CV_8UC3};

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("silent.mp4");
        // Floods stderr well past a pipe buffer before reading any frame.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("head -c 300000 /dev/zero >&2; cat > \"$0\"")
            .arg(&output);

        let encoder = FrameEncoder::spawn(cmd, &output, 64, 48, 2).unwrap();
        for _ in 0..30 {
            let frame =
                Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(7.0)).unwrap();
            encoder.push(frame).unwrap();
        }
        assert_eq!(encoder.finish().unwrap(), 30);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 30 * 64 * 48 * 3);
        assert_eq!(
            std::fs::metadata(dir.path().join("silent.log")).unwrap().len(),
            300_000
        );
    }

    #[test]
    fn test_push_rejects_mismatched_frame() {
        // `cat` stands in for ffmpeg so no encoder is needed.
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let (tx, rx) = channel::bounded::<Mat>(1);
        let encoder = FrameEncoder {
            tx: Some(tx),
            writer: Some(thread::spawn(move || write_worker(rx, stdin))),
            child,
            output: PathBuf::from("/nonexistent/out.mp4"),
            stderr_log: PathBuf::from("/nonexistent/out.log"),
            width: 64,
            height: 48,
        };

        let wrong = Mat::new_rows_cols_with_default(
            10,
            10,
            opencv::core::CV_8UC3,
            opencv::core::Scalar::all(0.0),
        )
        .unwrap();
        assert!(encoder.push(wrong).is_err());
        encoder.abort();
    }
}
