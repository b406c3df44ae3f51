use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Length of the shorter side, in pixels.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("embedding byte length {0} is not a multiple of 4")]
    InvalidLength(usize),
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Embeddings of different dimension are unrelated and score 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if !self.comparable(other) {
            return 0.0;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings; infinite across dimensions.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.dim() != other.dim() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Same dimension and, when both are known, the same producing model.
    pub fn comparable(&self, other: &Embedding) -> bool {
        if self.dim() != other.dim() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Serialize the vector as packed little-endian f32.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8], model_version: Option<String>) -> Result<Self, EmbeddingError> {
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::InvalidLength(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { values, model_version })
    }
}

/// One enrolled face in the recognition gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceModel {
    /// Enrollment ID.
    pub id: String,
    pub person_id: String,
    /// Display name of the person.
    pub label: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best match [-1, 1].
    pub similarity: f32,
    /// Enrollment that produced the best match (if matched).
    pub enrollment_id: Option<String>,
    pub person_id: Option<String>,
    pub label: Option<String>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            enrollment_id: None,
            person_id: None,
            label: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[FaceModel], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Always iterates ALL gallery entries, so the cost of a lookup does not
/// depend on where (or whether) the match sits in the gallery. Entries from
/// another model (different dimension or version) are never candidates.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[FaceModel], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, model) in gallery.iter().enumerate() {
            if !probe.comparable(&model.embedding) {
                tracing::debug!(enrollment_id = %model.id, "skipping embedding from another model");
                continue;
            }
            let sim = probe.similarity(&model.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                enrollment_id: Some(gallery[idx].id.clone()),
                person_id: Some(gallery[idx].person_id.clone()),
                label: Some(gallery[idx].label.clone()),
            },
            _ => MatchResult::no_match(if best_sim == f32::NEG_INFINITY { 0.0 } else { best_sim }),
        }
    }
}
