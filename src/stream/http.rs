//! HTTP routes for the feeds and the control panel

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use super::encoder::{StreamEncoder, CONTENT_TYPE};
use crate::app::App;
use crate::error::{CameraError, GalleryError, StageError};
use crate::gallery::ImageRef;
use crate::stage::JogDirection;

pub type AppState = Arc<App>;

/// Error body `{"error": "..."}` with a status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{} {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<CameraError> for ApiError {
    fn from(err: CameraError) -> Self {
        let status = match err {
            CameraError::NoDevice | CameraError::OpenFailed(_) | CameraError::NotInitialized => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CameraError::NotRunning => StatusCode::CONFLICT,
            CameraError::InvalidResolution { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err)
    }
}

impl From<GalleryError> for ApiError {
    fn from(err: GalleryError) -> Self {
        let status = match err {
            GalleryError::CameraUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GalleryError::NoFrame => StatusCode::CONFLICT,
            GalleryError::NotAFile(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err)
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        let status = match err {
            StageError::NotConnected | StageError::PortNotFound { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StageError::InvalidJog(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Feeds
        .route("/preview_feed", get(preview_feed))
        .route("/main_feed", get(main_feed))
        // Snapshots and gallery
        .route("/snapshot", post(snapshot))
        .route("/gallery", get(list_gallery).delete(remove_from_gallery))
        .route("/gallery/import", post(import_into_gallery))
        // Main camera
        .route("/camera/info", get(camera_info))
        .route("/camera/resolution", put(set_resolution))
        .route("/camera/snap", post(snap))
        // Panel
        .route("/zoom", get(get_zoom).put(set_zoom))
        .route("/stage/jog", post(jog))
        .route("/status", get(status))
        .with_state(state)
}

/// Streams an encoder as `multipart/x-mixed-replace`.
pub fn mjpeg_response(encoder: StreamEncoder) -> Response {
    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(encoder.into_stream()),
    )
        .into_response()
}

async fn preview_feed(State(app): State<AppState>) -> ApiResult<Response> {
    let starter = app.clone();
    tokio::task::spawn_blocking(move || starter.ensure_preview()).await??;
    Ok(mjpeg_response(app.preview_encoder()))
}

async fn main_feed(State(app): State<AppState>) -> ApiResult<Response> {
    let starter = app.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || starter.ensure_main()).await? {
        warn!("Main feed unavailable: {}", e);
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e));
    }
    Ok(mjpeg_response(app.main_encoder()))
}

async fn snapshot(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let entry = tokio::task::spawn_blocking(move || app.capture_snapshot()).await??;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn list_gallery(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.gallery().entries())
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    path: PathBuf,
}

async fn import_into_gallery(
    State(app): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> ApiResult<impl IntoResponse> {
    let entry = tokio::task::spawn_blocking(move || app.import_image(&req.path)).await??;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    reference: ImageRef,
}

async fn remove_from_gallery(
    State(app): State<AppState>,
    Json(req): Json<RemoveRequest>,
) -> impl IntoResponse {
    let removed = app.remove_image(&req.reference);
    Json(json!({ "removed": removed }))
}

async fn camera_info(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let info = app.camera_info().ok_or(CameraError::NotInitialized)?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct ResolutionRequest {
    index: usize,
}

async fn set_resolution(
    State(app): State<AppState>,
    Json(req): Json<ResolutionRequest>,
) -> ApiResult<impl IntoResponse> {
    let info = tokio::task::spawn_blocking(move || app.set_resolution(req.index)).await??;
    Ok(Json(info))
}

async fn snap(
    State(app): State<AppState>,
    Json(req): Json<ResolutionRequest>,
) -> ApiResult<impl IntoResponse> {
    app.snap(req.index)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ZoomRequest {
    zoom: f64,
}

async fn get_zoom(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "zoom": app.zoom() }))
}

async fn set_zoom(State(app): State<AppState>, Json(req): Json<ZoomRequest>) -> impl IntoResponse {
    Json(json!({ "zoom": app.set_zoom(req.zoom) }))
}

#[derive(Debug, Deserialize)]
struct JogRequest {
    direction: JogDirection,
    step: Option<f64>,
}

async fn jog(
    State(app): State<AppState>,
    Json(req): Json<JogRequest>,
) -> ApiResult<impl IntoResponse> {
    tokio::task::spawn_blocking(move || app.jog(req.direction, req.step)).await??;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{PatternProvider, SimulatedSdk};
    use crate::stage::StageClient;
    use crate::Config;
    use axum::http::Request;
    use futures::StreamExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(snapshot_dir: &std::path::Path) -> AppState {
        let mut config = Config::default();
        config.preview.poll_interval_ms = 5;
        config.preview.idle_interval_ms = 5;
        config.main.idle_interval_ms = 5;
        config.main.simulated_frame_interval_ms = 5;
        config.snapshots.directory = snapshot_dir.to_path_buf();
        Arc::new(
            App::new(
                config,
                Arc::new(PatternProvider::solid(64, 48, [0, 0, 255])),
                0,
                Arc::new(SimulatedSdk::new(Duration::from_millis(5))),
            )
            .with_stage(StageClient::from_writer("test", std::io::sink())),
        )
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn preview_feed_streams_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let app = state(dir.path());
        let response = create_router(app.clone())
            .oneshot(Request::get("/preview_feed").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        app.shutdown();
    }

    #[tokio::test]
    async fn main_feed_is_unavailable_without_camera() {
        let app = Arc::new(App::new(
            Config::default(),
            Arc::new(PatternProvider::failing_open()),
            0,
            Arc::new(SimulatedSdk::without_devices()),
        ));
        let response = create_router(app)
            .oneshot(Request::get("/main_feed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn snapshot_then_gallery_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let app = state(dir.path());
        let router = create_router(app.clone());

        let response = router
            .clone()
            .oneshot(Request::post("/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        app.ensure_main().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !app.main_camera().slot().has_frame() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let response = router
            .clone()
            .oneshot(Request::post("/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let entry = body_json(response).await;

        let response = router
            .clone()
            .oneshot(Request::get("/gallery").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        let response = router
            .clone()
            .oneshot(json_request(
                "DELETE",
                "/gallery",
                json!({ "reference": entry["reference"] }),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({ "removed": true }));
        assert!(app.gallery().is_empty());
        app.shutdown();
    }

    #[tokio::test]
    async fn zoom_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(state(dir.path()));

        let response = router
            .clone()
            .oneshot(json_request("PUT", "/zoom", json!({ "zoom": 2.26 })))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({ "zoom": 2.3 }));

        let response = router
            .oneshot(Request::get("/zoom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({ "zoom": 2.3 }));
    }

    #[tokio::test]
    async fn jog_validates_direction() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(state(dir.path()));

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/stage/jog",
                json!({ "direction": "x+", "step": 0.5 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router
            .oneshot(json_request("POST", "/stage/jog", json!({ "direction": "q+" })))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn resolution_requires_running_camera() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(state(dir.path()));
        let response = router
            .oneshot(json_request("PUT", "/camera/resolution", json!({ "index": 1 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn status_reports_driver_states() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(state(dir.path()));
        let response = router
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = body_json(response).await;
        assert_eq!(status["preview"]["state"], "stopped");
        assert_eq!(status["main"]["state"], "uninitialized");
        assert_eq!(status["zoom"], 1.0);
        assert_eq!(status["stage_port"], "test");
    }

    #[tokio::test]
    async fn import_copies_files_and_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let image = source.path().join("slide.png");
        std::fs::write(&image, b"png bytes").unwrap();
        let app = state(&dir.path().join("snaps"));
        let router = create_router(app.clone());

        let response = router
            .clone()
            .oneshot(json_request("POST", "/gallery/import", json!({ "path": image })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let entry = body_json(response).await;
        assert_eq!(entry["name"], "slide.png");
        assert_eq!(
            std::fs::read(dir.path().join("snaps").join("slide.png")).unwrap(),
            b"png bytes"
        );

        let response = router
            .oneshot(json_request(
                "POST",
                "/gallery/import",
                json!({ "path": source.path() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.gallery().len(), 1);
    }

    #[tokio::test]
    async fn camera_info_after_main_camera_starts() {
        let dir = tempfile::tempdir().unwrap();
        let app = state(dir.path());
        let router = create_router(app.clone());

        let response = router
            .clone()
            .oneshot(Request::get("/camera/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let starter = app.clone();
        tokio::task::spawn_blocking(move || starter.ensure_main())
            .await
            .unwrap()
            .unwrap();
        let response = router
            .oneshot(Request::get("/camera/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info = body_json(response).await;
        assert_eq!(info["resolution"], "320x240");
        assert_eq!(info["available_resolutions"].as_array().unwrap().len(), 2);
        app.shutdown();
    }

    #[tokio::test]
    async fn snap_needs_a_running_camera() {
        let dir = tempfile::tempdir().unwrap();
        let app = state(dir.path());
        let router = create_router(app.clone());

        let response = router
            .clone()
            .oneshot(json_request("POST", "/camera/snap", json!({ "index": 0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let starter = app.clone();
        tokio::task::spawn_blocking(move || starter.ensure_main())
            .await
            .unwrap()
            .unwrap();
        let response = router
            .oneshot(json_request("POST", "/camera/snap", json!({ "index": 0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        app.shutdown();
    }
}
