use facerec_core::{CosineMatcher, FaceModel, FacePipeline, FaceSample, Frame, MatchResult, Matcher, PipelineError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("No face detected in image")]
    NoFaceDetected,
    #[error("Face too small ({size:.0}px, minimum {min:.0}px)")]
    FaceTooSmall { size: f32, min: f32 },
    #[error("Image too dark")]
    TooDark,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Quality gates applied to every frame before it is accepted.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Minimum shorter side of the detected face, in pixels.
    pub min_face_px: f32,
    /// Fraction of dark pixels above which a frame is rejected.
    pub dark_threshold: f32,
}

/// Result of an enrollment operation.
#[derive(Debug)]
pub struct EnrollResult {
    pub sample: FaceSample,
}

impl EnrollResult {
    /// Detector confidence of the enrolled face.
    pub fn quality(&self) -> f32 {
        self.sample.face.confidence
    }
}

/// Result of an identification operation.
#[derive(Debug)]
pub struct IdentifyResult {
    pub sample: FaceSample,
    pub result: MatchResult,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Enroll {
        frame: Frame,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
    Identify {
        frame: Frame,
        gallery: Vec<FaceModel>,
        threshold: f32,
        reply: oneshot::Sender<Result<IdentifyResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    models: String,
}

impl EngineHandle {
    /// Detect the best face in `frame` and extract its embedding.
    pub async fn enroll(&self, frame: Frame) -> Result<EnrollResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Detect, extract, and compare against `gallery`.
    pub async fn identify(
        &self,
        frame: Frame,
        gallery: Vec<FaceModel>,
        threshold: f32,
    ) -> Result<IdentifyResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify {
                frame,
                gallery,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Description of the loaded models.
    pub fn models(&self) -> &str {
        &self.models
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The pipeline is moved onto the thread and serves one request at a time;
/// inference never runs on the async runtime.
pub fn spawn_engine<P>(mut pipeline: P, settings: EngineSettings) -> Result<EngineHandle, EngineError>
where
    P: FacePipeline + 'static,
{
    let models = pipeline.describe();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facerec-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { frame, reply } => {
                        let result = run_enroll(&mut pipeline, &settings, &frame);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Identify {
                        frame,
                        gallery,
                        threshold,
                        reply,
                    } => {
                        let result = run_identify(&mut pipeline, &settings, &frame, &gallery, threshold);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, models })
}

/// Run the quality gates and the pipeline on one frame.
fn best_face<P: FacePipeline>(
    pipeline: &mut P,
    settings: &EngineSettings,
    frame: &Frame,
) -> Result<FaceSample, EngineError> {
    if frame.is_dark(settings.dark_threshold) {
        return Err(EngineError::TooDark);
    }
    let sample = pipeline.best_face(frame)?.ok_or(EngineError::NoFaceDetected)?;
    let size = sample.face.min_side();
    if size < settings.min_face_px {
        return Err(EngineError::FaceTooSmall {
            size,
            min: settings.min_face_px,
        });
    }
    Ok(sample)
}

fn run_enroll<P: FacePipeline>(
    pipeline: &mut P,
    settings: &EngineSettings,
    frame: &Frame,
) -> Result<EnrollResult, EngineError> {
    let sample = best_face(pipeline, settings, frame)?;
    tracing::info!(
        confidence = sample.face.confidence,
        faces = sample.faces_found,
        "enroll: face selected"
    );
    Ok(EnrollResult { sample })
}

fn run_identify<P: FacePipeline>(
    pipeline: &mut P,
    settings: &EngineSettings,
    frame: &Frame,
    gallery: &[FaceModel],
    threshold: f32,
) -> Result<IdentifyResult, EngineError> {
    let sample = best_face(pipeline, settings, frame)?;
    let result = CosineMatcher.compare(&sample.embedding, gallery, threshold);
    tracing::debug!(
        matched = result.matched,
        similarity = result.similarity,
        gallery = gallery.len(),
        "identify: compared against gallery"
    );
    Ok(IdentifyResult { sample, result })
}

/// Deterministic pipeline for tests: colour in, colour out.
#[cfg(test)]
pub(crate) mod testing {
    use facerec_core::{BoundingBox, Embedding, FacePipeline, FaceSample, Frame, PipelineError};

    /// Treats any frame with colour as one full-frame face whose embedding is
    /// the normalised mean RGB. Grey frames contain no face.
    pub struct StubPipeline;

    impl FacePipeline for StubPipeline {
        fn best_face(&mut self, frame: &Frame) -> Result<Option<FaceSample>, PipelineError> {
            let mut sum = [0f64; 3];
            let mut coloured = false;
            for px in frame.data.chunks_exact(3) {
                coloured |= px[0] != px[1] || px[1] != px[2];
                for (acc, &v) in sum.iter_mut().zip(px) {
                    *acc += v as f64;
                }
            }
            if !coloured {
                return Ok(None);
            }
            let norm = sum.iter().map(|v| v * v).sum::<f64>().sqrt();
            let values = sum.iter().map(|v| (v / norm) as f32).collect();
            let (w, h) = (frame.width as f32, frame.height as f32);
            Ok(Some(FaceSample {
                face: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: w,
                    height: h,
                    confidence: 0.9,
                    landmarks: Some([
                        (w * 0.3, h * 0.4),
                        (w * 0.7, h * 0.4),
                        (w * 0.5, h * 0.55),
                        (w * 0.35, h * 0.75),
                        (w * 0.65, h * 0.75),
                    ]),
                },
                faces_found: 1,
                embedding: Embedding {
                    values,
                    model_version: Some("stub".into()),
                },
            }))
        }

        fn describe(&self) -> String {
            "stub".into()
        }
    }

    pub fn solid(r: u8, g: u8, b: u8, size: u32) -> Frame {
        let data = [r, g, b].repeat((size * size) as usize);
        Frame::from_rgb(data, size, size).expect("valid frame")
    }
}
