//! facerec-core: face detection and recognition engine.
//!
//! Decodes uploaded images into RGB frames, finds faces with SCRFD and
//! embeds them with ArcFace, both running via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod detector;
pub mod frame;
pub mod pipeline;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::FaceDetector;
pub use frame::Frame;
pub use pipeline::{FacePipeline, FaceSample, OnnxPipeline, PipelineError};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, CosineMatcher, Embedding, FaceModel, MatchResult, Matcher};

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/facerec/models`
/// (falling back to `~/.local/share/facerec/models`).
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// Default data directory: `$XDG_DATA_HOME/facerec`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facerec")
}
