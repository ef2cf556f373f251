// Error kinds surfaced by a processing run.
//
// Fatal conditions are `PipelineError` values and stop the run. Non-fatal
// conditions are `Warning` values collected into the job summary.

use crate::pipeline::status::JobStage;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Fatal errors that abort a run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Video encoding failed: {reason}")]
    Encode { reason: String },

    #[error("Invalid mode options: {details}")]
    InvalidModeOptions { details: String },

    #[error("Frame {index} failed to process: {reason}")]
    FrameProcessing { index: usize, reason: String },

    #[error("Watermark detector unavailable: {reason}")]
    DetectorUnavailable { reason: String },

    #[error("Run cancelled before frame {next_frame}")]
    Cancelled { next_frame: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn decode(path: &std::path::Path, err: impl fmt::Display) -> Self {
        Self::Decode {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn encode(err: impl fmt::Display) -> Self {
        Self::Encode {
            reason: err.to_string(),
        }
    }

    pub fn frame(index: usize, err: impl fmt::Display) -> Self {
        Self::FrameProcessing {
            index,
            reason: err.to_string(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// A structured run failure: the error plus where the job stood when it stopped.
#[derive(Error, Debug)]
#[error("Job {job_id} failed during {stage} at {progress}%: {source}")]
pub struct JobFailure {
    pub job_id: String,
    pub stage: JobStage,
    pub progress: u8,
    #[source]
    pub source: PipelineError,
}

/// Non-fatal degradations recorded in the job summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Warning {
    /// Audio could not be attached; the silent video was kept as output.
    AudioMux(String),
    /// Model-based inpainting failed to initialize; fallback used for the run.
    ModelUnavailable(String),
    /// No frame was ever detected; frames were re-encoded unchanged.
    NothingDetected,
    /// Input container extension is outside the supported set.
    UnsupportedContainer(String),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::AudioMux(reason) => write!(f, "audio mux failed, kept silent video: {}", reason),
            Warning::ModelUnavailable(reason) => {
                write!(f, "inpainting model unavailable, using fallback: {}", reason)
            }
            Warning::NothingDetected => write!(f, "no watermark detected in any frame"),
            Warning::UnsupportedContainer(ext) => write!(f, "unsupported container extension: {}", ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_failure_message_carries_stage_and_progress() {
        let failure = JobFailure {
            job_id: "job-1".to_string(),
            stage: JobStage::Inpainting,
            progress: 62,
            source: PipelineError::frame(7, "model returned wrong size"),
        };
        let msg = failure.to_string();
        assert!(msg.contains("job-1"));
        assert!(msg.contains("inpainting"));
        assert!(msg.contains("62%"));
        assert!(msg.contains("Frame 7"));
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let json = serde_json::to_value(Warning::AudioMux("no audio".to_string())).unwrap();
        assert_eq!(json["kind"], "audio_mux");
        assert_eq!(json["detail"], "no audio");

        let json = serde_json::to_value(Warning::NothingDetected).unwrap();
        assert_eq!(json["kind"], "nothing_detected");
    }
}
