pub mod capabilities;
pub mod error;
pub mod options;
pub mod pipeline;
pub mod video;

pub use capabilities::Capabilities;
pub use error::{JobFailure, PipelineError, Warning};
pub use options::{ModelConfig, ProcessOptions};
pub use pipeline::orchestrator::{CancelToken, Pipeline};
pub use pipeline::status::{JobStage, JobSummary, ProgressSink};
pub use pipeline::types::{CropEdge, ProcessingMode, ProcessingResult};
