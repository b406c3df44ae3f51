//! Frame type and image decoding: uploaded bytes to packed RGB, plus the darkness check.

use thiserror::Error;

/// Luma below this value counts as a dark pixel.
const DARK_LUMA: u8 = 32;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("image is empty")]
    Empty,
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("invalid RGB length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A decoded RGB image.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Decode an encoded image (PNG, JPEG, WebP, ...) into an RGB frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    /// Wrap already-decoded packed RGB8 pixels.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    /// RGB value at (x, y). Caller guarantees bounds.
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Per-pixel luma (BT.601 weights).
    pub fn luma(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|p| {
                let y = 299 * p[0] as u32 + 587 * p[1] as u32 + 114 * p[2] as u32;
                (y / 1000) as u8
            })
            .collect()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let luma = self.luma();
        if luma.is_empty() {
            return 0.0;
        }
        luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32
    }

    /// True if more than `threshold_pct` of the pixels are dark.
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        is_dark_frame(&self.luma(), threshold_pct)
    }
}

/// Returns true if more than `threshold_pct` of pixels fall in the darkest
/// bucket (luma 0–31). An empty buffer is dark.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < DARK_LUMA).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}
