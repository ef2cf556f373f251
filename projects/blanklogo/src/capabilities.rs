// Process-wide model capabilities.
//
// Models are loaded once per process and shared by every run. Each is wrapped
// in a mutex: runs may execute on separate threads, but a single model only
// serves one frame at a time.

use crate::error::PipelineError;
use crate::options::ModelConfig;
use crate::pipeline::detection::{RtDetrDetector, WatermarkDetector};
use crate::pipeline::inpaint::{Inpainter, LamaInpainter, SharedInpainter};
use crate::pipeline::mask::DEFAULT_STRIDE;
use crate::pipeline::types::{CropEdge, ProcessingMode};
use crate::video::SUPPORTED_CONTAINERS;
use serde::Serialize;
use std::sync::{Arc, Mutex};

pub type SharedDetector = Arc<Mutex<Box<dyn WatermarkDetector>>>;

pub struct Capabilities {
    detector: Result<SharedDetector, String>,
    inpainter: Result<SharedInpainter, String>,
}

impl Capabilities {
    /// Load every configured model. Never fails: an unavailable model is
    /// recorded and reported when a run needs it.
    ///
    /// The model is loaded with its own dimension multiple; a run's configured
    /// stride is combined with it at dispatch time.
    pub fn load(config: &ModelConfig) -> Self {
        let detector = match &config.detector_model {
            None => Err("no detector model configured".to_string()),
            Some(path) => RtDetrDetector::new(path)
                .map(|d| Arc::new(Mutex::new(Box::new(d) as Box<dyn WatermarkDetector>)))
                .map_err(|e| format!("{:#}", e)),
        };
        if let Err(reason) = &detector {
            tracing::error!("Watermark detector unavailable: {}", reason);
        }

        let inpainter = match &config.inpaint_model {
            None => Err("no inpainting model configured".to_string()),
            Some(path) => LamaInpainter::load(path, config.device, DEFAULT_STRIDE)
                .map(|m| Arc::new(Mutex::new(Box::new(m) as Box<dyn Inpainter>)))
                .map_err(|e| format!("{:#}", e)),
        };
        if let Err(reason) = &inpainter {
            tracing::warn!("Inpainting model unavailable, fallback will be used: {}", reason);
        }

        Self {
            detector,
            inpainter,
        }
    }

    /// Assemble capabilities from already-constructed backends.
    pub fn from_parts(
        detector: Option<Box<dyn WatermarkDetector>>,
        inpainter: Option<Box<dyn Inpainter>>,
    ) -> Self {
        Self {
            detector: detector
                .map(|d| Arc::new(Mutex::new(d)))
                .ok_or_else(|| "no detector provided".to_string()),
            inpainter: inpainter
                .map(|m| Arc::new(Mutex::new(m)))
                .ok_or_else(|| "no inpainting model provided".to_string()),
        }
    }

    pub fn detector(&self) -> Result<SharedDetector, PipelineError> {
        self.detector
            .as_ref()
            .map(Arc::clone)
            .map_err(|reason| PipelineError::DetectorUnavailable {
                reason: reason.clone(),
            })
    }

    /// The inpainting model, if it initialized.
    pub fn inpainter(&self) -> Option<SharedInpainter> {
        self.inpainter.as_ref().ok().map(Arc::clone)
    }

    /// Why the inpainting model is unavailable, if it is.
    pub fn model_unavailable(&self) -> Option<&str> {
        self.inpainter.as_ref().err().map(String::as_str)
    }

    pub fn report(&self) -> CapabilityReport {
        CapabilityReport {
            detector_ready: self.detector.is_ok(),
            detector_error: self.detector.as_ref().err().cloned(),
            inpaint_model_ready: self.inpainter.is_ok(),
            inpaint_model_error: self.inpainter.as_ref().err().cloned(),
            uses_fallback_inpainting: self.inpainter.is_err(),
            modes: ProcessingMode::NAMES.to_vec(),
            crop_positions: CropEdge::ALL
                .iter()
                .map(|e| e.as_str())
                .collect(),
            containers: SUPPORTED_CONTAINERS.to_vec(),
        }
    }
}

/// What this process can do, as printed by `blanklogo capabilities`
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityReport {
    pub detector_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector_error: Option<String>,
    pub inpaint_model_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inpaint_model_error: Option<String>,
    pub uses_fallback_inpainting: bool,
    pub modes: Vec<&'static str>,
    pub crop_positions: Vec<&'static str>,
    pub containers: Vec<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_unconfigured_models_are_reported_not_fatal() {
        let caps = Capabilities::load(&ModelConfig::default());
        assert!(matches!(
            caps.detector(),
            Err(PipelineError::DetectorUnavailable { .. })
        ));
        assert!(caps.inpainter().is_none());
        assert!(caps.model_unavailable().is_some());

        let report = caps.report();
        assert!(!report.detector_ready);
        assert!(report.uses_fallback_inpainting);
        assert_eq!(report.modes, vec!["crop", "inpaint", "auto"]);
        assert_eq!(report.crop_positions, vec!["top", "bottom", "left", "right"]);
    }

    #[test]
    fn test_missing_inpaint_model_records_reason() {
        let config = ModelConfig {
            inpaint_model: Some(PathBuf::from("/nonexistent/lama.onnx")),
            ..ModelConfig::default()
        };
        let caps = Capabilities::load(&config);
        let reason = caps.model_unavailable().unwrap();
        assert!(reason.contains("not found"), "{}", reason);
    }
}
