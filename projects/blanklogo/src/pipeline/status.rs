// Job status tracking: stage transitions, progress, throughput and ETA.
//
// One tracker per run. Observers receive integer percentages through an
// injected `ProgressSink`; emission is rate-limited per stage.

use crate::error::{JobFailure, PipelineError, Warning};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Receives coarse progress updates (0-100).
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, percent: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(u8) + Send + Sync,
{
    fn on_progress(&self, percent: u8) {
        self(percent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Initializing,
    Loading,
    Detecting,
    Inpainting,
    Skipped,
    Encoding,
    Complete,
    Failed,
    Cancelled,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Initializing => "initializing",
            JobStage::Loading => "loading",
            JobStage::Detecting => "detecting",
            JobStage::Inpainting => "inpainting",
            JobStage::Skipped => "skipped",
            JobStage::Encoding => "encoding",
            JobStage::Complete => "complete",
            JobStage::Failed => "failed",
            JobStage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStage::Complete | JobStage::Failed | JobStage::Cancelled
        )
    }

    /// Progress range covered by per-frame work in this stage.
    fn band(&self) -> (u8, u8) {
        match self {
            JobStage::Initializing => (0, 5),
            JobStage::Loading => (5, 20),
            JobStage::Detecting => (20, 50),
            JobStage::Inpainting => (50, 85),
            JobStage::Skipped => (85, 85),
            JobStage::Encoding => (85, 100),
            JobStage::Complete => (100, 100),
            JobStage::Failed | JobStage::Cancelled => (0, 0),
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTransition {
    pub stage: JobStage,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Throughput {
    pub elapsed_secs: f64,
    pub frames_per_sec: f64,
    /// `None` until at least one frame has completed.
    pub eta_secs: Option<f64>,
}

/// Throughput and ETA for `done` of `total` frames after `elapsed_secs`.
pub fn throughput(done: usize, total: usize, elapsed_secs: f64) -> Throughput {
    let frames_per_sec = if elapsed_secs > 0.0 {
        done as f64 / elapsed_secs
    } else {
        0.0
    };
    let eta_secs = if frames_per_sec > 0.0 {
        Some(total.saturating_sub(done) as f64 / frames_per_sec)
    } else {
        None
    };
    Throughput {
        elapsed_secs,
        frames_per_sec,
        eta_secs,
    }
}

/// Final accounting for a run
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub stage: JobStage,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total_frames: usize,
    pub frames_processed: usize,
    pub watermarks_detected: usize,
    pub average_fps: f64,
    pub warnings: Vec<Warning>,
    pub errors: Vec<String>,
    pub transitions: Vec<StageTransition>,
}

static LAST_JOB_STAMP: AtomicI64 = AtomicI64::new(0);

/// Generate a job id from a strictly increasing microsecond clock.
pub fn generate_job_id() -> String {
    let now = Utc::now().timestamp_micros();
    let prev = LAST_JOB_STAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    format!("job-{}", now.max(prev + 1))
}

pub struct JobTracker {
    job_id: String,
    stage: JobStage,
    progress: u8,
    total_frames: usize,
    processed_frames: usize,
    watermark_count: usize,
    warnings: Vec<Warning>,
    errors: Vec<String>,
    transitions: Vec<StageTransition>,
    started_at: DateTime<Utc>,
    start: Instant,
    stage_start: Instant,
    last_emit_frame: usize,
    emit_every: usize,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl JobTracker {
    pub fn new(
        job_id: Option<String>,
        emit_every: usize,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        let job_id = job_id.unwrap_or_else(generate_job_id);
        let now = Utc::now();
        Self {
            job_id,
            stage: JobStage::Initializing,
            progress: 0,
            total_frames: 0,
            processed_frames: 0,
            watermark_count: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
            transitions: vec![StageTransition {
                stage: JobStage::Initializing,
                at: now,
            }],
            started_at: now,
            start: Instant::now(),
            stage_start: Instant::now(),
            last_emit_frame: 0,
            emit_every: emit_every.max(1),
            sink,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Move to `stage`, timestamp the transition and raise progress to the stage floor.
    pub fn enter(&mut self, stage: JobStage) {
        if self.stage.is_terminal() {
            return;
        }
        tracing::info!(
            "Job {}: {} -> {} ({:.2}s elapsed)",
            self.job_id,
            self.stage,
            stage,
            self.elapsed_secs()
        );
        self.stage = stage;
        self.stage_start = Instant::now();
        self.last_emit_frame = 0;
        self.transitions.push(StageTransition {
            stage,
            at: Utc::now(),
        });
        let (floor, _) = stage.band();
        self.set_progress(floor);
    }

    pub fn set_total_frames(&mut self, total: usize) {
        self.total_frames = total;
    }

    pub fn set_processed_frames(&mut self, processed: usize) {
        self.processed_frames = processed;
    }

    pub fn set_watermark_count(&mut self, count: usize) {
        self.watermark_count = count;
    }

    /// Raise progress; never lowers it.
    pub fn set_progress(&mut self, percent: u8) {
        let percent = percent.min(100);
        if percent <= self.progress {
            return;
        }
        self.progress = percent;
        if let Some(sink) = &self.sink {
            sink.on_progress(percent);
        }
    }

    /// Record that `done` of `total` frames finished in the current stage.
    /// Emits at most every `emit_every` frames or every 10% of `total`, and
    /// never twice for the same count. Counts past `total` are clamped.
    /// Returns whether anything was emitted.
    pub fn frame_done(&mut self, done: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        let done = done.min(total);
        if done <= self.last_emit_frame {
            return false;
        }
        let tenth = (total / 10).max(1);
        let due = done >= total
            || done / tenth > self.last_emit_frame / tenth
            || done - self.last_emit_frame >= self.emit_every;
        if !due {
            return false;
        }
        self.last_emit_frame = done;

        let rate = throughput(done, total, self.stage_start.elapsed().as_secs_f64());
        let (lo, hi) = self.stage.band();
        let percent = lo as usize + (hi - lo) as usize * done / total;
        self.set_progress(percent as u8);

        match rate.eta_secs {
            Some(eta) => tracing::info!(
                "Job {} {}: {}/{} frames ({:.1} fps, ETA {:.1}s)",
                self.job_id,
                self.stage,
                done,
                total,
                rate.frames_per_sec,
                eta
            ),
            None => tracing::info!(
                "Job {} {}: {}/{} frames",
                self.job_id,
                self.stage,
                done,
                total
            ),
        }
        true
    }

    /// Record a non-fatal condition and log it.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("Job {}: {}", self.job_id, warning);
        self.record_warning(warning);
    }

    /// Record a non-fatal condition that was already logged elsewhere.
    pub fn record_warning(&mut self, warning: Warning) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    fn summary(&self) -> JobSummary {
        let elapsed_secs = self.elapsed_secs();
        JobSummary {
            job_id: self.job_id.clone(),
            stage: self.stage,
            progress: self.progress,
            started_at: self.started_at,
            elapsed_secs,
            total_frames: self.total_frames,
            frames_processed: self.processed_frames,
            watermarks_detected: self.watermark_count,
            average_fps: throughput(self.processed_frames, self.total_frames, elapsed_secs)
                .frames_per_sec,
            warnings: self.warnings.clone(),
            errors: self.errors.clone(),
            transitions: self.transitions.clone(),
        }
    }

    /// Close the run successfully.
    pub fn complete(&mut self) -> JobSummary {
        self.enter(JobStage::Complete);
        let summary = self.summary();
        tracing::info!(
            "Job {} complete: {} frames, {} watermarked, {:.2}s, {:.1} fps, {} warning(s)",
            summary.job_id,
            summary.frames_processed,
            summary.watermarks_detected,
            summary.elapsed_secs,
            summary.average_fps,
            summary.warnings.len()
        );
        summary
    }

    /// Close the run on a fatal error, keeping the last stage and progress reached.
    pub fn fail(&mut self, error: PipelineError) -> JobFailure {
        let stage_reached = self.stage;
        let progress = self.progress;
        self.errors.push(error.to_string());
        let terminal = if error.is_cancellation() {
            JobStage::Cancelled
        } else {
            JobStage::Failed
        };
        tracing::error!(
            "Job {} {} during {} at {}%: {}",
            self.job_id,
            terminal,
            stage_reached,
            progress,
            error
        );
        self.stage = terminal;
        self.transitions.push(StageTransition {
            stage: terminal,
            at: Utc::now(),
        });
        JobFailure {
            job_id: self.job_id.clone(),
            stage: stage_reached,
            progress,
            source: error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_tracker() -> (JobTracker, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |p: u8| {
            sink_seen.lock().unwrap().push(p);
        });
        (JobTracker::new(Some("test".to_string()), 1000, Some(sink)), seen)
    }

    #[test]
    fn test_throughput_and_eta() {
        let rate = throughput(50, 200, 10.0);
        assert_eq!(rate.frames_per_sec, 5.0);
        assert_eq!(rate.eta_secs, Some(30.0));

        let idle = throughput(0, 200, 0.0);
        assert_eq!(idle.frames_per_sec, 0.0);
        assert!(idle.eta_secs.is_none());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (mut tracker, seen) = recording_tracker();
        tracker.enter(JobStage::Loading);
        tracker.set_progress(40);
        tracker.set_progress(30);
        tracker.enter(JobStage::Detecting); // floor 20 < 40, no change
        assert_eq!(tracker.progress(), 40);

        let values = seen.lock().unwrap().clone();
        assert_eq!(values, vec![5, 40]);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_frame_progress_is_rate_limited() {
        let (mut tracker, seen) = recording_tracker();
        tracker.enter(JobStage::Detecting);
        for done in 1..=100 {
            tracker.frame_done(done, 100);
        }
        assert_eq!(tracker.progress(), 50);
        // Floor + one emission per 10%.
        let values = seen.lock().unwrap().clone();
        assert_eq!(values.len(), 11);
        assert_eq!(values.first(), Some(&20));
        assert_eq!(values.last(), Some(&50));
    }

    #[test]
    fn test_frames_past_declared_total_do_not_emit() {
        let (mut tracker, seen) = recording_tracker();
        tracker.enter(JobStage::Loading);
        assert!(tracker.frame_done(3, 3));
        assert!(!tracker.frame_done(3, 3));
        assert!(!tracker.frame_done(5, 3));
        assert!(!tracker.frame_done(400, 3));
        assert_eq!(tracker.progress(), 20);
        assert_eq!(seen.lock().unwrap().clone(), vec![5, 20]);
    }

    #[test]
    fn test_complete_summary() {
        let (mut tracker, _) = recording_tracker();
        tracker.set_total_frames(10);
        tracker.enter(JobStage::Loading);
        tracker.enter(JobStage::Detecting);
        tracker.set_watermark_count(0);
        tracker.warn(Warning::NothingDetected);
        tracker.warn(Warning::NothingDetected);
        tracker.enter(JobStage::Skipped);
        tracker.enter(JobStage::Encoding);
        tracker.set_processed_frames(10);
        let summary = tracker.complete();

        assert_eq!(summary.stage, JobStage::Complete);
        assert_eq!(summary.progress, 100);
        assert_eq!(summary.watermarks_detected, 0);
        assert_eq!(summary.frames_processed, 10);
        assert_eq!(summary.warnings, vec![Warning::NothingDetected]);
        let stages: Vec<JobStage> = summary.transitions.iter().map(|t| t.stage).collect();
        assert_eq!(
            stages,
            vec![
                JobStage::Initializing,
                JobStage::Loading,
                JobStage::Detecting,
                JobStage::Skipped,
                JobStage::Encoding,
                JobStage::Complete
            ]
        );
    }

    #[test]
    fn test_fail_reports_last_stage() {
        let (mut tracker, _) = recording_tracker();
        tracker.enter(JobStage::Inpainting);
        let failure = tracker.fail(PipelineError::frame(3, "boom"));
        assert_eq!(failure.stage, JobStage::Inpainting);
        assert_eq!(failure.progress, 50);
        assert_eq!(tracker.stage(), JobStage::Failed);

        // Terminal stage sticks.
        tracker.enter(JobStage::Encoding);
        assert_eq!(tracker.stage(), JobStage::Failed);
    }

    #[test]
    fn test_cancellation_is_terminal_cancelled() {
        let (mut tracker, _) = recording_tracker();
        tracker.enter(JobStage::Detecting);
        let failure = tracker.fail(PipelineError::Cancelled { next_frame: 4 });
        assert_eq!(failure.stage, JobStage::Detecting);
        assert_eq!(tracker.stage(), JobStage::Cancelled);
    }

    #[test]
    fn test_generated_job_ids_are_unique() {
        let a = generate_job_id();
        let b = generate_job_id();
        assert_ne!(a, b);
        assert!(a.starts_with("job-"));
    }
}
