// Watermark removal pipeline: detection, gap filling, masking, inpainting

pub mod crop;
pub mod detection;
pub mod gap_fill;
pub mod inpaint;
pub mod mask;
pub mod orchestrator;
pub mod status;
pub mod types;
