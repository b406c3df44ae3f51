//! Detection + embedding composed into a single per-frame step.

use crate::detector::{DetectorError, FaceDetector};
use crate::frame::Frame;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// The most confident face in a frame together with its embedding.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub face: BoundingBox,
    /// Number of faces the detector found in the frame.
    pub faces_found: usize,
    pub embedding: Embedding,
}

/// Turns a frame into (at most) one embedded face.
pub trait FacePipeline: Send {
    /// Returns `Ok(None)` when the frame contains no face.
    fn best_face(&mut self, frame: &Frame) -> Result<Option<FaceSample>, PipelineError>;

    /// Short description of the loaded models, for status reporting.
    fn describe(&self) -> String;
}

/// SCRFD detection followed by ArcFace embedding.
pub struct OnnxPipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxPipeline {
    pub fn load(scrfd_path: &Path, arcface_path: &Path, intra_threads: usize) -> Result<Self, PipelineError> {
        let detector = FaceDetector::load(scrfd_path, intra_threads)?;
        let recognizer = FaceRecognizer::load(arcface_path, intra_threads)?;
        Ok(Self { detector, recognizer })
    }
}

impl FacePipeline for OnnxPipeline {
    fn best_face(&mut self, frame: &Frame) -> Result<Option<FaceSample>, PipelineError> {
        let faces = self.detector.detect(frame)?;
        let Some(face) = faces.first() else {
            return Ok(None);
        };
        let embedding = self.recognizer.extract(frame, face)?;
        Ok(Some(FaceSample {
            face: face.clone(),
            faces_found: faces.len(),
            embedding,
        }))
    }

    fn describe(&self) -> String {
        format!("scrfd det_10g + arcface {}", crate::recognizer::ARCFACE_MODEL_VERSION)
    }
}
