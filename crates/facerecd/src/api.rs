//! HTTP routes under `/api`.

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::{error_response, ApiError};
use crate::store::{NewPerson, Person, PersonUpdate, Store};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use facerec_core::{CosineMatcher, FaceModel, Frame, Matcher};
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;

const DEFAULT_RECOGNITION_LIMIT: usize = 50;
const MAX_RECOGNITION_LIMIT: usize = 500;
const PERSON_RECOGNITION_HISTORY: usize = 10;

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub store: Store,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(engine: EngineHandle, store: Store, config: Config) -> Self {
        Self {
            engine,
            store,
            config: Arc::new(config),
        }
    }
}

/// Build the full application router with its middleware stack.
pub fn router(state: AppState) -> Router {
    let max_body = state.config.max_body_bytes;
    let cors = cors_layer(state.config.cors_origins.as_deref());

    Router::new()
        .route("/api/health", get(health))
        .route("/api/enroll", post(enroll))
        .route("/api/recognize", post(recognize))
        .route("/api/persons", get(list_persons))
        .route(
            "/api/persons/{id}",
            get(get_person).put(update_person).delete(delete_person),
        )
        .route(
            "/api/persons/{id}/enrollments/{enrollment_id}",
            delete(delete_enrollment),
        )
        .route("/api/recognitions", get(list_recognitions))
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(origins: Option<&[String]>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods(cors::Any)
        .allow_headers(cors::Any);
    match origins {
        None => base.allow_origin(cors::Any),
        Some(list) => {
            let allowed: Vec<HeaderValue> = list
                .iter()
                .filter_map(|s| match s.parse() {
                    Ok(hv) => Some(hv),
                    Err(e) => {
                        tracing::error!("Invalid CORS origin configured: {} - Error: {}", s, e);
                        None
                    }
                })
                .collect();
            base.allow_origin(allowed)
        }
    }
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(detail, "handler panicked");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Endpoint not found".into())
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(ApiError::TooLarge)
        }
        Err(rejection) => Err(ApiError::BadRequest(format!(
            "Invalid request body: {}",
            rejection.body_text()
        ))),
    }
}

/// Decode a base64 (optionally `data:` URL) payload into an RGB frame.
fn decode_image(payload: Option<&str>) -> Result<Frame, ApiError> {
    let raw = payload
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No image provided".into()))?;

    let encoded = match raw.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| ApiError::BadRequest("Malformed data URL".into()))?,
        None => raw,
    };

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::BadRequest(format!("Invalid base64 image: {e}")))?;
    Frame::decode(&bytes).map_err(|e| ApiError::BadRequest(format!("Invalid image: {e}")))
}

async fn decode_image_blocking(payload: Option<String>) -> Result<Frame, ApiError> {
    tokio::task::spawn_blocking(move || decode_image(payload.as_deref()))
        .await
        .map_err(|e| ApiError::Internal(format!("image decoding task failed: {e}")))?
}

/// Trimmed, non-empty string or `None`.
fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn health(State(state): State<AppState>) -> ApiResult {
    let counts = state.store.counts().await?;
    Ok(Json(json!({
        "status": "healthy",
        "message": "Face Recognition API is running",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.engine.models(),
        "persons": counts.persons,
        "enrollments": counts.enrollments,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct EnrollRequest {
    pub image: Option<String>,
    pub person_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub national_code: Option<String>,
    pub employee_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub metadata: Option<Value>,
    #[serde(default)]
    pub replace: bool,
}

/// Where an enrolled face goes: an existing person or one created on success.
enum EnrollTarget {
    Existing(Person),
    New(NewPerson),
}

impl EnrollTarget {
    fn person_id(&self) -> Option<&str> {
        match self {
            Self::Existing(p) => Some(&p.id),
            Self::New(_) => None,
        }
    }
}

fn new_person(req: &mut EnrollRequest) -> Result<NewPerson, ApiError> {
    let (Some(first_name), Some(last_name)) =
        (clean(req.first_name.take()), clean(req.last_name.take()))
    else {
        return Err(ApiError::BadRequest(
            "First name and last name are required".into(),
        ));
    };
    Ok(NewPerson {
        first_name,
        last_name,
        national_code: clean(req.national_code.take()),
        employee_id: clean(req.employee_id.take()),
        email: clean(req.email.take()),
        phone: clean(req.phone.take()),
        department: clean(req.department.take()),
        position: clean(req.position.take()),
        metadata: req.metadata.take(),
    })
}

async fn enroll(
    State(state): State<AppState>,
    payload: Result<Json<EnrollRequest>, JsonRejection>,
) -> ApiResult {
    let mut req = json_body(payload)?;

    let target = match clean(req.person_id.take()) {
        Some(id) => {
            let person = state
                .store
                .get_person(&id)
                .await?
                .ok_or_else(|| ApiError::NotFound("Person not found".into()))?;
            EnrollTarget::Existing(person)
        }
        None => EnrollTarget::New(new_person(&mut req)?),
    };

    let frame = decode_image_blocking(req.image.take()).await?;
    let result = tokio::time::timeout(state.config.engine_timeout(), state.engine.enroll(frame)).await??;
    let embedding = &result.sample.embedding;

    if state.config.reject_duplicates {
        let others: Vec<FaceModel> = state
            .store
            .gallery()
            .await?
            .into_iter()
            .filter(|m| Some(m.person_id.as_str()) != target.person_id())
            .collect();
        let existing = CosineMatcher.compare(embedding, &others, state.config.similarity_threshold);
        if existing.matched {
            return Err(ApiError::Conflict(format!(
                "Face already enrolled for {}",
                existing.label.unwrap_or_default()
            )));
        }
    }

    let (person_id, enrollment) = match target {
        EnrollTarget::Existing(person) => {
            let enrollment = state
                .store
                .add_enrollment(&person.id, embedding, result.quality(), req.replace)
                .await?;
            (person.id, enrollment)
        }
        EnrollTarget::New(new) => {
            let (person, enrollment) = state
                .store
                .create_person_with_enrollment(new, embedding, result.quality())
                .await?;
            (person.id, enrollment)
        }
    };

    tracing::info!(
        person_id = %person_id,
        enrollment_id = %enrollment.id,
        quality = enrollment.quality,
        "face enrolled"
    );

    Ok(Json(json!({
        "success": true,
        "message": "Face enrolled successfully",
        "person_id": person_id,
        "enrollment_id": enrollment.id,
        "quality": enrollment.quality,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RecognizeRequest {
    pub image: Option<String>,
}

async fn recognize(
    State(state): State<AppState>,
    payload: Result<Json<RecognizeRequest>, JsonRejection>,
) -> ApiResult {
    let req = json_body(payload)?;
    let frame = decode_image_blocking(req.image).await?;
    let gallery = state.store.gallery().await?;

    let out = tokio::time::timeout(
        state.config.engine_timeout(),
        state
            .engine
            .identify(frame, gallery, state.config.similarity_threshold),
    )
    .await??;
    let result = out.result;

    state
        .store
        .record_recognition(
            result.person_id.clone(),
            result.enrollment_id.clone(),
            result.similarity,
            result.matched,
        )
        .await?;

    let person = match result.person_id.as_deref() {
        Some(id) => state.store.get_person(id).await?,
        None => None,
    };

    tracing::info!(
        matched = result.matched,
        person_id = ?result.person_id,
        similarity = result.similarity,
        "recognition"
    );

    Ok(Json(json!({
        "success": true,
        "matched": result.matched,
        "person_id": result.person_id,
        "confidence": result.similarity,
        "person": person,
        "face": out.sample.face,
        "faces_found": out.sample.faces_found,
    })))
}

async fn list_persons(State(state): State<AppState>) -> ApiResult {
    let persons = state.store.list_persons().await?;
    Ok(Json(json!({ "success": true, "persons": persons })))
}

async fn get_person(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let person = state
        .store
        .get_person(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Person not found".into()))?;
    let recognitions = state
        .store
        .recent_recognitions(PERSON_RECOGNITION_HISTORY, Some(id))
        .await?;
    Ok(Json(json!({
        "success": true,
        "person": person,
        "recognitions": recognitions,
    })))
}

async fn update_person(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<PersonUpdate>, JsonRejection>,
) -> ApiResult {
    let body = json_body(payload)?;
    let blank = |v: &Option<String>| v.as_deref().is_some_and(|s| s.trim().is_empty());
    if blank(&body.first_name) || blank(&body.last_name) {
        return Err(ApiError::BadRequest(
            "First name and last name cannot be empty".into(),
        ));
    }
    let update = PersonUpdate {
        first_name: clean(body.first_name),
        last_name: clean(body.last_name),
        national_code: clean(body.national_code),
        employee_id: clean(body.employee_id),
        email: clean(body.email),
        phone: clean(body.phone),
        department: clean(body.department),
        position: clean(body.position),
        metadata: body.metadata,
        is_active: body.is_active,
    };
    let person = state
        .store
        .update_person(&id, update)
        .await?
        .ok_or_else(|| ApiError::NotFound("Person not found".into()))?;
    Ok(Json(json!({ "success": true, "person": person })))
}

async fn delete_person(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    if !state.store.delete_person(&id).await? {
        return Err(ApiError::NotFound("Person not found".into()));
    }
    Ok(Json(json!({
        "success": true,
        "message": "Person deleted successfully",
    })))
}

async fn delete_enrollment(
    State(state): State<AppState>,
    Path((id, enrollment_id)): Path<(String, String)>,
) -> ApiResult {
    if !state.store.delete_enrollment(&id, &enrollment_id).await? {
        return Err(ApiError::NotFound("Enrollment not found".into()));
    }
    Ok(Json(json!({
        "success": true,
        "message": "Enrollment deleted successfully",
    })))
}

#[derive(Debug, Deserialize)]
pub struct RecognitionsQuery {
    pub limit: Option<usize>,
    pub person_id: Option<String>,
}

async fn list_recognitions(
    State(state): State<AppState>,
    query: Result<Query<RecognitionsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) =
        query.map_err(|e| ApiError::BadRequest(format!("Invalid query: {}", e.body_text())))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECOGNITION_LIMIT)
        .clamp(1, MAX_RECOGNITION_LIMIT);
    let recognitions = state
        .store
        .recent_recognitions(limit, clean(query.person_id))
        .await?;
    Ok(Json(json!({ "success": true, "recognitions": recognitions })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EmbeddingCipher;
    use crate::engine::testing::StubPipeline;
    use crate::engine::{spawn_engine, EngineSettings};
    use facerec_core::{FacePipeline, FaceSample, PipelineError};
    use image::{ImageFormat, Rgb, RgbImage};
    use reqwest::Client;
    use std::io::Cursor;
    use std::time::Duration;

    const RED: [u8; 3] = [200, 30, 30];
    const GREEN: [u8; 3] = [30, 200, 30];
    const GRAY: [u8; 3] = [128, 128, 128];
    const BLACK: [u8; 3] = [0, 0, 0];

    /// Answers like the stub, but only after a pause.
    struct SlowPipeline(Duration);

    impl FacePipeline for SlowPipeline {
        fn best_face(&mut self, frame: &Frame) -> Result<Option<FaceSample>, PipelineError> {
            std::thread::sleep(self.0);
            StubPipeline.best_face(frame)
        }

        fn describe(&self) -> String {
            "slow".into()
        }
    }

    /// Takes the engine thread down on the first frame.
    struct CrashingPipeline;

    impl FacePipeline for CrashingPipeline {
        fn best_face(&mut self, _frame: &Frame) -> Result<Option<FaceSample>, PipelineError> {
            panic!("inference crashed")
        }

        fn describe(&self) -> String {
            "crashing".into()
        }
    }

    fn png_base64(rgb: [u8; 3], size: u32) -> String {
        let img = RgbImage::from_pixel(size, size, Rgb(rgb));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        STANDARD.encode(buf)
    }

    async fn spawn_app(config: Config) -> String {
        spawn_app_with(StubPipeline, config).await
    }

    async fn spawn_app_with<P: FacePipeline + 'static>(pipeline: P, config: Config) -> String {
        let store = Store::open_in_memory(EmbeddingCipher::from_passphrase("test"))
            .await
            .unwrap();
        let engine = spawn_engine(
            pipeline,
            EngineSettings {
                min_face_px: config.min_face_px,
                dark_threshold: config.dark_threshold,
            },
        )
        .unwrap();
        let app = router(AppState::new(engine, store, config));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    async fn app() -> String {
        spawn_app(Config::default()).await
    }

    async fn post(base: &str, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = Client::new()
            .post(format!("{base}{path}"))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.json().await.unwrap())
    }

    async fn get_json(base: &str, path: &str) -> (StatusCode, Value) {
        let resp = reqwest::get(format!("{base}{path}")).await.unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.json().await.unwrap())
    }

    async fn enroll_new(base: &str, rgb: [u8; 3], first: &str) -> String {
        let (status, body) = post(
            base,
            "/api/enroll",
            json!({ "image": png_base64(rgb, 64), "first_name": first, "last_name": "Doe" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["person_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let base = app().await;
        let (status, body) = get_json(&base, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["message"], "Face Recognition API is running");
        assert_eq!(body["persons"], 0);
        assert!(body.get("success").is_none());
    }

    #[tokio::test]
    async fn test_list_persons_empty() {
        let base = app().await;
        let (status, body) = get_json(&base, "/api/persons").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "persons": [] }));
    }

    #[tokio::test]
    async fn test_enroll_then_recognize() {
        let base = app().await;
        let (status, body) = post(
            &base,
            "/api/enroll",
            json!({
                "image": format!("data:image/png;base64,{}", png_base64(RED, 64)),
                "first_name": "Ada",
                "last_name": "Lovelace",
                "employee_id": "E-1",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Face enrolled successfully");
        let person_id = body["person_id"].as_str().unwrap().to_string();
        assert!(body["enrollment_id"].is_string());

        let (status, body) = post(&base, "/api/recognize", json!({ "image": png_base64(RED, 64) })).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["matched"], true);
        assert_eq!(body["person_id"], person_id.as_str());
        assert!(body["confidence"].as_f64().unwrap() >= 0.40);
        assert_eq!(body["person"]["first_name"], "Ada");
        assert_eq!(body["face"]["width"], 64.0);

        let (_, body) = post(&base, "/api/recognize", json!({ "image": png_base64(GREEN, 64) })).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["matched"], false);
        assert!(body["person_id"].is_null());
        assert!(body["person"].is_null());

        let (_, body) = get_json(&base, "/api/recognitions").await;
        assert_eq!(body["recognitions"].as_array().unwrap().len(), 2);

        let (_, body) = get_json(&base, &format!("/api/persons/{person_id}")).await;
        assert_eq!(body["person"]["employee_id"], "E-1");
        assert_eq!(body["person"]["enrollments"].as_array().unwrap().len(), 1);
        assert_eq!(body["recognitions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_validation_errors() {
        let base = app().await;

        let (status, body) = post(&base, "/api/enroll", json!({ "first_name": "A", "last_name": "B" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "success": false, "error": "No image provided" }));

        let (status, body) = post(&base, "/api/enroll", json!({ "image": png_base64(RED, 64) })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "First name and last name are required");

        let (status, body) = post(
            &base,
            "/api/enroll",
            json!({ "image": "%%%not base64%%%", "first_name": "A", "last_name": "B" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = post(
            &base,
            "/api/enroll",
            json!({ "image": STANDARD.encode(b"not an image"), "first_name": "A", "last_name": "B" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid image"));

        let (status, body) = post(
            &base,
            "/api/enroll",
            json!({ "image": png_base64(RED, 64), "person_id": "ghost" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Person not found");
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let base = app().await;
        let resp = Client::new()
            .post(format!("{base}/api/enroll"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));
    }

    #[tokio::test]
    async fn test_unusable_images_are_unprocessable() {
        let base = app().await;
        for (rgb, size, expected) in [
            (GRAY, 64, "No face detected in image"),
            (BLACK, 64, "Image too dark"),
            (RED, 16, "Face too small"),
        ] {
            let (status, body) = post(
                &base,
                "/api/enroll",
                json!({ "image": png_base64(rgb, size), "first_name": "A", "last_name": "B" }),
            )
            .await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
            assert!(body["error"].as_str().unwrap().starts_with(expected), "{body}");
        }
        // nothing was created for the rejected attempts
        let (_, body) = get_json(&base, "/api/persons").await;
        assert_eq!(body["persons"], json!([]));
    }

    #[tokio::test]
    async fn test_recognize_unusable_images() {
        let base = app().await;
        enroll_new(&base, RED, "Ada").await;
        for (rgb, size, expected) in [
            (GRAY, 64, "No face detected in image"),
            (BLACK, 64, "Image too dark"),
            (RED, 16, "Face too small"),
        ] {
            let (status, body) =
                post(&base, "/api/recognize", json!({ "image": png_base64(rgb, size) })).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
            assert_eq!(body["success"], false);
            assert!(body["error"].as_str().unwrap().starts_with(expected), "{body}");
        }
        // rejected frames are not logged as recognition attempts
        let (_, body) = get_json(&base, "/api/recognitions").await;
        assert_eq!(body["recognitions"], json!([]));
    }

    #[tokio::test]
    async fn test_engine_timeout_is_unavailable() {
        let base = spawn_app_with(
            SlowPipeline(Duration::from_millis(1500)),
            Config {
                engine_timeout_secs: 0,
                ..Config::default()
            },
        )
        .await;
        let (status, body) = post(&base, "/api/recognize", json!({ "image": png_base64(RED, 64) })).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({ "success": false, "error": "request timed out" }));

        let (status, body) = post(
            &base,
            "/api/enroll",
            json!({ "image": png_base64(RED, 64), "first_name": "Ada", "last_name": "Doe" }),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        let (_, body) = get_json(&base, "/api/persons").await;
        assert_eq!(body["persons"], json!([]));
    }

    #[tokio::test]
    async fn test_dead_engine_is_unavailable() {
        let base = spawn_app_with(CrashingPipeline, Config::default()).await;
        for _ in 0..2 {
            let (status, body) =
                post(&base, "/api/recognize", json!({ "image": png_base64(RED, 64) })).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{body}");
            assert_eq!(body["success"], false);
        }
        // the rest of the API keeps serving
        let (status, _) = get_json(&base, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_duplicate_face_rejected() {
        let base = app().await;
        let ada = enroll_new(&base, RED, "Ada").await;

        let (status, body) = post(
            &base,
            "/api/enroll",
            json!({ "image": png_base64(RED, 64), "first_name": "Eve", "last_name": "Doe" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().starts_with("Face already enrolled"));

        // a second face for the same person is fine
        let (status, _) = post(&base, "/api/enroll", json!({ "image": png_base64(RED, 64), "person_id": ada })).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_duplicates_allowed_when_disabled() {
        let base = spawn_app(Config {
            reject_duplicates: false,
            ..Config::default()
        })
        .await;
        enroll_new(&base, RED, "Ada").await;
        enroll_new(&base, RED, "Eve").await;
    }

    #[tokio::test]
    async fn test_unique_employee_id_conflict() {
        let base = app().await;
        let (status, _) = post(
            &base,
            "/api/enroll",
            json!({ "image": png_base64(RED, 64), "first_name": "A", "last_name": "B", "employee_id": "E-7" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = post(
            &base,
            "/api/enroll",
            json!({ "image": png_base64(GREEN, 64), "first_name": "C", "last_name": "D", "employee_id": "E-7" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Employee ID already exists");
    }

    #[tokio::test]
    async fn test_replace_enrollment() {
        let base = app().await;
        let id = enroll_new(&base, RED, "Ada").await;
        let (status, _) = post(
            &base,
            "/api/enroll",
            json!({ "image": png_base64(GREEN, 64), "person_id": id, "replace": true }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = get_json(&base, &format!("/api/persons/{id}")).await;
        assert_eq!(body["person"]["enrollments"].as_array().unwrap().len(), 1);
        let (_, body) = post(&base, "/api/recognize", json!({ "image": png_base64(RED, 64) })).await;
        assert_eq!(body["matched"], false);
    }

    #[tokio::test]
    async fn test_delete_person() {
        let base = app().await;
        let id = enroll_new(&base, RED, "Ada").await;
        let client = Client::new();

        let resp = client.delete(format!("{base}/api/persons/{id}")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({ "success": true, "message": "Person deleted successfully" }));

        let resp = client.delete(format!("{base}/api/persons/{id}")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({ "success": false, "error": "Person not found" }));

        let (_, body) = post(&base, "/api/recognize", json!({ "image": png_base64(RED, 64) })).await;
        assert_eq!(body["matched"], false);
    }

    #[tokio::test]
    async fn test_delete_enrollment() {
        let base = app().await;
        let (_, body) = post(
            &base,
            "/api/enroll",
            json!({ "image": png_base64(RED, 64), "first_name": "Ada", "last_name": "Doe" }),
        )
        .await;
        let person = body["person_id"].as_str().unwrap();
        let enrollment = body["enrollment_id"].as_str().unwrap();
        let client = Client::new();

        let url = format!("{base}/api/persons/{person}/enrollments/{enrollment}");
        assert_eq!(client.delete(&url).send().await.unwrap().status().as_u16(), 200);
        assert_eq!(client.delete(&url).send().await.unwrap().status().as_u16(), 404);

        let (_, body) = get_json(&base, &format!("/api/persons/{person}")).await;
        assert_eq!(body["person"]["enrollments"], json!([]));
    }

    #[tokio::test]
    async fn test_deactivated_person_not_recognized() {
        let base = app().await;
        let id = enroll_new(&base, RED, "Ada").await;

        let resp = Client::new()
            .put(format!("{base}/api/persons/{id}"))
            .json(&json!({ "is_active": false, "department": "Ops" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["person"]["is_active"], false);
        assert_eq!(body["person"]["department"], "Ops");
        assert_eq!(body["person"]["first_name"], "Ada");

        let (_, body) = post(&base, "/api/recognize", json!({ "image": png_base64(RED, 64) })).await;
        assert_eq!(body["matched"], false);
    }

    #[tokio::test]
    async fn test_update_rejects_blank_name_and_unknown_person() {
        let base = app().await;
        let id = enroll_new(&base, RED, "Ada").await;
        let client = Client::new();

        let resp = client
            .put(format!("{base}/api/persons/{id}"))
            .json(&json!({ "first_name": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        let resp = client
            .put(format!("{base}/api/persons/ghost"))
            .json(&json!({ "department": "Ops" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_recognitions_limit() {
        let base = app().await;
        for _ in 0..3 {
            post(&base, "/api/recognize", json!({ "image": png_base64(RED, 64) })).await;
        }
        let (_, body) = get_json(&base, "/api/recognitions?limit=2").await;
        assert_eq!(body["recognitions"].as_array().unwrap().len(), 2);

        let ada = enroll_new(&base, RED, "Ada").await;
        post(&base, "/api/recognize", json!({ "image": png_base64(RED, 64) })).await;
        let (_, body) = get_json(&base, &format!("/api/recognitions?person_id={ada}")).await;
        let mine = body["recognitions"].as_array().unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0]["person_id"], ada.as_str());
        let (_, body) = get_json(&base, "/api/recognitions?person_id=ghost").await;
        assert_eq!(body["recognitions"], json!([]));

        let (status, body) = get_json(&base, "/api/recognitions?limit=lots").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let base = app().await;
        let (status, body) = get_json(&base, "/api/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "success": false, "error": "Endpoint not found" }));
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let base = app().await;
        let resp = Client::new()
            .get(format!("{base}/api/health"))
            .header("origin", "http://frontend.example")
            .send()
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_allowlist() {
        let base = spawn_app(Config {
            cors_origins: Some(vec!["http://kiosk.example".into()]),
            ..Config::default()
        })
        .await;
        let client = Client::new();

        let resp = client
            .get(format!("{base}/api/health"))
            .header("origin", "http://kiosk.example")
            .send()
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "http://kiosk.example"
        );

        let resp = client
            .get(format!("{base}/api/health"))
            .header("origin", "http://elsewhere.example")
            .send()
            .await
            .unwrap();
        assert!(resp.headers().get("access-control-allow-origin").is_none());

        let resp = client
            .request(reqwest::Method::OPTIONS, format!("{base}/api/enroll"))
            .header("origin", "http://kiosk.example")
            .header("access-control-request-method", "POST")
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "http://kiosk.example"
        );
    }

    #[tokio::test]
    async fn test_body_limit() {
        let base = spawn_app(Config {
            max_body_bytes: 1024,
            ..Config::default()
        })
        .await;
        let (status, body) = post(
            &base,
            "/api/recognize",
            json!({ "image": png_base64(RED, 256) + &"A".repeat(4096) }),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_panic_becomes_error_envelope() {
        async fn boom() -> &'static str {
            panic!("boom")
        }
        let app = Router::new()
            .route("/boom", get(boom))
            .layer(CatchPanicLayer::custom(panic_response));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let (status, body) = get_json(&format!("http://{addr}"), "/boom").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "success": false, "error": "Internal server error" }));
    }
}
