use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0).
    pub host: String,
    /// Listen port (default: 5000).
    pub port: u16,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the embedding key file, used when no secret is configured.
    pub key_path: PathBuf,
    /// Passphrase the embedding key is derived from; overrides `key_path`.
    pub secret: Option<String>,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Refuse to enroll a face that already matches another person.
    pub reject_duplicates: bool,
    /// Minimum length, in pixels, of the shorter side of an enrolled face.
    pub min_face_px: f32,
    /// Fraction of dark pixels above which an image is rejected.
    pub dark_threshold: f32,
    /// Timeout in seconds for one engine request.
    pub engine_timeout_secs: u64,
    /// ONNX Runtime intra-op threads per model.
    pub inference_threads: usize,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// Allowed CORS origins; `None` allows any origin.
    pub cors_origins: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = facerec_core::default_data_dir();
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            model_dir: facerec_core::default_model_dir(),
            db_path: data_dir.join("faces.db"),
            key_path: data_dir.join("embedding.key"),
            secret: None,
            similarity_threshold: 0.40,
            reject_duplicates: true,
            min_face_px: 40.0,
            dark_threshold: 0.95,
            engine_timeout_secs: 10,
            inference_threads: 2,
            max_body_bytes: 16 * 1024 * 1024,
            cors_origins: None,
        }
    }
}

impl Config {
    /// Load configuration from `FACEREC_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            host: get("FACEREC_HOST").unwrap_or(d.host),
            port: parsed(&get, "FACEREC_PORT", d.port),
            model_dir: get("FACEREC_MODEL_DIR").map(PathBuf::from).unwrap_or(d.model_dir),
            db_path: get("FACEREC_DB_PATH").map(PathBuf::from).unwrap_or(d.db_path),
            key_path: get("FACEREC_KEY_PATH").map(PathBuf::from).unwrap_or(d.key_path),
            secret: get("FACEREC_SECRET").filter(|s| !s.is_empty()),
            similarity_threshold: parsed(&get, "FACEREC_SIMILARITY_THRESHOLD", d.similarity_threshold),
            reject_duplicates: get("FACEREC_REJECT_DUPLICATES")
                .map(|v| v != "0")
                .unwrap_or(d.reject_duplicates),
            min_face_px: parsed(&get, "FACEREC_MIN_FACE_PX", d.min_face_px),
            dark_threshold: parsed(&get, "FACEREC_DARK_THRESHOLD", d.dark_threshold),
            engine_timeout_secs: parsed(&get, "FACEREC_ENGINE_TIMEOUT_SECS", d.engine_timeout_secs),
            inference_threads: parsed(&get, "FACEREC_INFERENCE_THREADS", d.inference_threads),
            max_body_bytes: parsed(&get, "FACEREC_MAX_BODY_BYTES", d.max_body_bytes),
            cors_origins: get("FACEREC_CORS_ORIGINS").and_then(|v| parse_origins(&v)),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(facerec_core::SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(facerec_core::ARCFACE_MODEL_FILE)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Comma-separated origin list; `*` (or nothing) means any origin.
fn parse_origins(raw: &str) -> Option<Vec<String>> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        None
    } else {
        Some(origins)
    }
}
