use crate::capabilities::{Capabilities, SharedDetector};
use crate::error::{JobFailure, PipelineError, Warning};
use crate::options::ProcessOptions;
use crate::pipeline::crop::{compute_crop, run_crop};
use crate::pipeline::detection::classify;
use crate::pipeline::gap_fill::{count_detected, count_interpolated, fill_missed_detections};
use crate::pipeline::inpaint::{InpaintBackendKind, InpaintDispatcher};
use crate::pipeline::status::{JobStage, JobTracker, ProgressSink};
use crate::pipeline::types::{CropEdge, Detection, Frame, ProcessingMode, ProcessingResult};
use crate::video::writer::{mux_audio, EncodeSettings, FrameEncoder};
use crate::video::{self, VideoInfo, VideoReader};
use opencv::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag, checked between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, next_frame: usize) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled { next_frame });
        }
        Ok(())
    }
}

/// Mode-specific outcome, before the job summary is attached.
#[derive(Default)]
struct RunOutcome {
    frames_processed: Option<usize>,
    watermarks_detected: Option<usize>,
    interpolated_frames: Option<usize>,
    inpaint_backend: Option<InpaintBackendKind>,
    crop: Option<(u32, CropEdge)>,
    original_size: (u32, u32),
    output_size: (u32, u32),
    detections: Vec<Detection>,
}

/// Frames after detection and (conditional) inpainting.
struct FrameRun {
    frames: Vec<Frame>,
    detections: Vec<Detection>,
    backend: Option<InpaintBackendKind>,
}

/// One configured pipeline. Each `process` call is an independent job; the
/// only state shared between jobs is the injected `Capabilities`.
pub struct Pipeline {
    options: ProcessOptions,
    capabilities: Arc<Capabilities>,
    sink: Option<Arc<dyn ProgressSink>>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(options: ProcessOptions, capabilities: Arc<Capabilities>) -> Self {
        Self {
            options,
            capabilities,
            sink: None,
            cancel: CancelToken::default(),
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Remove the watermark from `input` and write the result to `output`.
    ///
    /// `output` is only created on success.
    pub fn process(
        &self,
        input: &Path,
        output: &Path,
        mode: &ProcessingMode,
    ) -> Result<ProcessingResult, JobFailure> {
        let mut tracker = JobTracker::new(
            self.options.job_id.clone(),
            self.options.progress_every_frames,
            self.sink.clone(),
        );
        tracing::info!(
            "Job {}: {} mode, {:?} -> {:?}",
            tracker.job_id(),
            mode.name(),
            input,
            output
        );

        if !video::is_supported_container(input) {
            let ext = input
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string();
            tracker.warn(Warning::UnsupportedContainer(ext));
        }

        let outcome = match mode {
            ProcessingMode::Crop { pixels, edge } => {
                self.crop_video(input, output, *pixels, *edge, &mut tracker)
            }
            ProcessingMode::Inpaint | ProcessingMode::Auto => {
                self.inpaint_video(input, output, &mut tracker)
            }
        };

        let outcome = outcome.map_err(|e| tracker.fail(e))?;
        let summary = tracker.complete();
        let frames_per_sec = match outcome.frames_processed {
            Some(n) if summary.elapsed_secs > 0.0 => n as f64 / summary.elapsed_secs,
            _ => 0.0,
        };

        Ok(ProcessingResult {
            job_id: summary.job_id.clone(),
            mode: mode.name().to_string(),
            frames_processed: outcome.frames_processed,
            watermarks_detected: outcome.watermarks_detected,
            interpolated_frames: outcome.interpolated_frames,
            inpaint_backend: outcome.inpaint_backend,
            crop_pixels: outcome.crop.map(|(p, _)| p),
            crop_position: outcome.crop.map(|(_, e)| e),
            original_size: outcome.original_size,
            output_size: outcome.output_size,
            elapsed_secs: summary.elapsed_secs,
            frames_per_sec,
            warnings: summary.warnings.clone(),
            summary,
            detections: outcome.detections,
        })
    }

    fn crop_video(
        &self,
        input: &Path,
        output: &Path,
        pixels: u32,
        edge: CropEdge,
        tracker: &mut JobTracker,
    ) -> Result<RunOutcome, PipelineError> {
        tracker.enter(JobStage::Loading);
        let info = video::probe(input).map_err(|e| PipelineError::decode(input, format!("{:#}", e)))?;
        let rect = compute_crop(info.width, info.height, pixels, edge)?;

        tracker.enter(JobStage::Encoding);
        let work = work_dir(output)?;
        let staged = work.path().join(staged_name(output, "cropped"));
        run_crop(input, &staged, &rect).map_err(|e| PipelineError::encode(format!("{:#}", e)))?;
        fs::rename(&staged, output)?;

        Ok(RunOutcome {
            crop: Some((pixels, edge)),
            original_size: (info.width, info.height),
            output_size: (rect.width, rect.height),
            ..RunOutcome::default()
        })
    }

    fn inpaint_video(
        &self,
        input: &Path,
        output: &Path,
        tracker: &mut JobTracker,
    ) -> Result<RunOutcome, PipelineError> {
        let detector = self.capabilities.detector()?;
        let mut dispatcher = self.dispatcher(tracker);

        tracker.enter(JobStage::Loading);
        let (info, frames) = self.load_frames(input, tracker)?;
        tracker.set_total_frames(frames.len());

        let run = run_frames(
            frames,
            &detector,
            &mut dispatcher,
            self.options.confidence_threshold,
            &self.cancel,
            tracker,
        )?;

        tracker.enter(JobStage::Encoding);
        let size = (info.width, info.height);
        let frames_processed = run.frames.len();
        self.encode(input, output, &info, run.frames, tracker)?;

        Ok(RunOutcome {
            frames_processed: Some(frames_processed),
            watermarks_detected: Some(count_detected(&run.detections)),
            interpolated_frames: Some(count_interpolated(&run.detections)),
            inpaint_backend: run.backend,
            crop: None,
            original_size: size,
            output_size: size,
            detections: run.detections,
        })
    }

    /// Pick the inpainting backend for this run.
    fn dispatcher(&self, tracker: &mut JobTracker) -> InpaintDispatcher {
        let model = self.capabilities.inpainter();
        if model.is_none() {
            if let Some(reason) = self.capabilities.model_unavailable() {
                // Logged when the capabilities were loaded.
                tracker.record_warning(Warning::ModelUnavailable(reason.to_string()));
            }
        }
        InpaintDispatcher::new(
            model,
            self.options.fallback.clone(),
            self.options.mask_padding,
            self.options.stride,
        )
    }

    fn load_frames(
        &self,
        input: &Path,
        tracker: &mut JobTracker,
    ) -> Result<(VideoInfo, Vec<Frame>), PipelineError> {
        let mut reader = video::open_reader(input, self.options.decoder)
            .map_err(|e| PipelineError::decode(input, format!("{:#}", e)))?;
        let (info, frames) = read_frames(input, reader.as_mut(), &self.cancel, tracker)?;
        tracing::info!(
            "Loaded {} frames ({}x{} @ {:.2} fps)",
            frames.len(),
            info.width,
            info.height,
            info.fps
        );
        Ok((info, frames))
    }

    /// Stream frames through the encoder, attach audio, and move the result into place.
    fn encode(
        &self,
        input: &Path,
        output: &Path,
        info: &VideoInfo,
        frames: Vec<Frame>,
        tracker: &mut JobTracker,
    ) -> Result<(), PipelineError> {
        let (width, height) = match frames.first() {
            Some(f) => (f.image.cols() as u32, f.image.rows() as u32),
            None => return Err(PipelineError::encode("no frames to encode")),
        };
        let settings = EncodeSettings {
            crf: self.options.crf,
            preset: self.options.preset.clone(),
            queue: self.options.encoder_queue,
        };

        let work = work_dir(output)?;
        let silent = work.path().join("silent.mp4");
        let encoder = FrameEncoder::start(&silent, width, height, info.fps, &settings)
            .map_err(|e| PipelineError::encode(format!("{:#}", e)))?;

        let total = frames.len();
        for (i, frame) in frames.into_iter().enumerate() {
            let pushed = self
                .cancel
                .check(i)
                .and_then(|_| {
                    encoder
                        .push(frame.image)
                        .map_err(|e| PipelineError::encode(format!("{:#}", e)))
                });
            if let Err(e) = pushed {
                encoder.abort();
                return Err(e);
            }
            tracker.frame_done(i + 1, total);
        }
        encoder
            .finish()
            .map_err(|e| PipelineError::encode(format!("{:#}", e)))?;

        let finished = if info.has_audio {
            let muxed = work.path().join("muxed.mp4");
            match mux_audio(&silent, input, &muxed) {
                Ok(()) => muxed,
                Err(e) => {
                    tracker.warn(Warning::AudioMux(format!("{:#}", e)));
                    silent
                }
            }
        } else {
            tracker.warn(Warning::AudioMux("input has no audio track".to_string()));
            silent
        };

        fs::rename(&finished, output)?;
        Ok(())
    }
}

/// Decode every frame of `reader` in order. The returned info carries the
/// decoded count; the declared count only drives progress.
fn read_frames(
    input: &Path,
    reader: &mut dyn VideoReader,
    cancel: &CancelToken,
    tracker: &mut JobTracker,
) -> Result<(VideoInfo, Vec<Frame>), PipelineError> {
    let mut info = *reader.info();
    let estimate = info.frame_count;

    let mut frames = Vec::with_capacity(estimate);
    loop {
        cancel.check(frames.len())?;
        let Some(image) = reader
            .next_frame()
            .map_err(|e| PipelineError::decode(input, format!("{:#}", e)))?
        else {
            break;
        };
        frames.push(Frame {
            index: frames.len(),
            image,
        });
        if frames.len() <= estimate {
            tracker.frame_done(frames.len(), estimate);
        }
    }

    if frames.is_empty() {
        return Err(PipelineError::decode(input, "no frames decoded"));
    }
    if frames.len() != estimate {
        tracing::debug!(
            "Decoded {} frames, container declared {}",
            frames.len(),
            estimate
        );
    }
    info.frame_count = frames.len();
    Ok((info, frames))
}

/// Detect every frame, fill gaps, then inpaint the frames that carry a region.
fn run_frames(
    mut frames: Vec<Frame>,
    detector: &SharedDetector,
    dispatcher: &mut InpaintDispatcher,
    threshold: f32,
    cancel: &CancelToken,
    tracker: &mut JobTracker,
) -> Result<FrameRun, PipelineError> {
    let total = frames.len();

    tracker.enter(JobStage::Detecting);
    let mut direct = Vec::with_capacity(total);
    for frame in &frames {
        cancel.check(frame.index)?;
        let candidate = {
            let mut detector = detector
                .lock()
                .map_err(|_| PipelineError::frame(frame.index, "detector lock poisoned"))?;
            detector
                .detect(&frame.image)
                .map_err(|e| PipelineError::frame(frame.index, format!("{:#}", e)))?
        };
        let detection = classify(candidate, threshold);
        tracing::debug!("Frame {}: {:?}", frame.index, detection);
        direct.push(detection);
        tracker.frame_done(direct.len(), total);
    }

    let detections = fill_missed_detections(&direct);
    let watermarks = count_detected(&detections);
    tracker.set_watermark_count(watermarks);
    tracing::info!(
        "Watermark found in {}/{} frames ({} directly, {} filled from neighbors)",
        watermarks,
        total,
        count_detected(&direct),
        count_interpolated(&detections)
    );

    if watermarks == 0 {
        tracker.warn(Warning::NothingDetected);
        tracker.enter(JobStage::Skipped);
        tracker.set_processed_frames(total);
        return Ok(FrameRun {
            frames,
            detections,
            backend: None,
        });
    }

    tracker.enter(JobStage::Inpainting);
    for (done, (frame, detection)) in frames.iter_mut().zip(&detections).enumerate() {
        cancel.check(frame.index)?;
        if let Some(image) = dispatcher.process_frame(frame, detection)? {
            frame.image = image;
        }
        tracker.frame_done(done + 1, total);
    }
    tracker.set_processed_frames(total);

    Ok(FrameRun {
        frames,
        detections,
        backend: Some(dispatcher.kind()),
    })
}

/// Scratch directory next to `output` so the final rename stays on one filesystem.
fn work_dir(output: &Path) -> Result<tempfile::TempDir, PipelineError> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(tempfile::Builder::new()
        .prefix(".blanklogo-")
        .tempdir_in(parent)?)
}

fn staged_name(output: &Path, stem: &str) -> String {
    match output.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", stem, ext),
        None => format!("{}.mp4", stem),
    }
}
