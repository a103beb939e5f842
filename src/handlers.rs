use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::{Camera, DrawElement, Roi};
use crate::errors::StreamError;
use crate::streams::StreamManager;
use crate::AppState;

#[derive(Serialize)]
pub struct ApiResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    pub fn success() -> Self {
        Self { status: "success".to_string(), id: None, error: None }
    }

    pub fn success_with_id(id: impl Into<String>) -> Self {
        Self { status: "success".to_string(), id: Some(id.into()), error: None }
    }

    pub fn error(message: &str) -> Self {
        Self { status: "error".to_string(), id: None, error: Some(message.to_string()) }
    }
}

fn error_response(err: &StreamError) -> Response {
    (err.http_status(), Json(ApiResponse::error(&err.to_string()))).into_response()
}

pub async fn root_handler() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/config")]).into_response()
}

pub async fn config_page() -> Html<&'static str> {
    Html(include_str!("../static/config.html"))
}

pub async fn monitor_page() -> Html<&'static str> {
    Html(include_str!("../static/monitor.html"))
}

pub async fn api_list_cameras(State(state): State<AppState>) -> Json<Vec<Camera>> {
    Json(state.registry.list().await)
}

pub async fn api_add_camera(State(state): State<AppState>, body: String) -> Response {
    let camera: Camera = match serde_json::from_str(&body) {
        Ok(camera) => camera,
        Err(_) => {
            return error_response(&StreamError::bad_input("invalid JSON"));
        }
    };
    let id = camera.id.clone();
    match state.add_camera(camera).await {
        Ok(()) => {
            (StatusCode::CREATED, Json(ApiResponse::success_with_id(id))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn api_update_camera(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: String,
) -> Response {
    let camera: Camera = match serde_json::from_str(&body) {
        Ok(camera) => camera,
        Err(_) => return error_response(&StreamError::bad_input("invalid JSON")),
    };
    match state.update_camera(&id, camera).await {
        Ok(()) => Json(ApiResponse::success()).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn api_delete_camera(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.delete_camera(&id).await {
        Ok(()) => Json(ApiResponse::success()).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Body of the annotation endpoint. Both schemas are accepted; whichever
/// lists are present replace their counterparts.
#[derive(Deserialize)]
pub struct AnnotationUpdate {
    pub roi: Option<Vec<Roi>>,
    #[serde(rename = "drawElements")]
    pub draw_elements: Option<Vec<DrawElement>>,
}

pub async fn api_update_annotations(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: String,
) -> Response {
    let update: AnnotationUpdate = match serde_json::from_str(&body) {
        Ok(update) => update,
        Err(_) => return error_response(&StreamError::bad_input("invalid JSON")),
    };
    match state.update_annotations(&id, update.roi, update.draw_elements).await {
        Ok(()) => Json(ApiResponse::success()).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn api_start_stream(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.streams.start(&id).await {
        Ok(()) => Json(ApiResponse::success()).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn api_stop_stream(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.streams.stop(&id) {
        Ok(()) => Json(ApiResponse::success()).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatus {
    #[serde(flatten)]
    pub camera: Camera,
    pub is_streaming: bool,
    pub viewer_count: usize,
    pub last_viewed: Option<DateTime<Utc>>,
}

pub async fn api_status(State(state): State<AppState>) -> Json<Vec<CameraStatus>> {
    let cameras = state.registry.list().await;
    let statuses = cameras
        .into_iter()
        .map(|camera| {
            let status = state.streams.status(&camera.id);
            CameraStatus {
                camera,
                is_streaming: status.is_streaming,
                viewer_count: status.viewer_count,
                last_viewed: status.last_viewed,
            }
        })
        .collect();
    Json(statuses)
}

/// MJPEG subscription endpoint.
///
/// Attaches a viewer (starting the pipeline on demand), then streams
/// multipart frames until the client disconnects. The detach runs exactly
/// once, from the drop of the guard held by the response body.
pub async fn stream_handler(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let camera_id = strip_stream_extension(&id).to_string();
    match state.streams.attach(&camera_id).await {
        Ok(broadcaster) => {
            let viewer = Uuid::new_v4();
            debug!("Viewer {} connected to camera {}", viewer, camera_id);
            let guard = ViewerGuard { streams: state.streams.clone(), camera_id, viewer };
            broadcaster.subscribe().into_response(guard)
        }
        Err(e) => error_response(&e),
    }
}

// Clients may request /stream/cam1.mjpg or similar; the extension is
// cosmetic.
fn strip_stream_extension(id: &str) -> &str {
    match id.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => id,
    }
}

struct ViewerGuard {
    streams: Arc<StreamManager>,
    camera_id: String,
    viewer: Uuid,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        debug!("Viewer {} disconnected from camera {}", self.viewer, self.camera_id);
        self.streams.detach(&self.camera_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_stream_extension() {
        assert_eq!(strip_stream_extension("cam1"), "cam1");
        assert_eq!(strip_stream_extension("cam1.mjpg"), "cam1");
        assert_eq!(strip_stream_extension("cam.front.flv"), "cam.front");
    }

    #[test]
    fn test_status_serializes_flattened_camelcase() {
        let status = CameraStatus {
            camera: Camera {
                id: "cam1".to_string(),
                name: "Front".to_string(),
                rtsp_url: "rtsp://x/1".to_string(),
                roi: Vec::new(),
                draw_elements: Vec::new(),
                enabled: true,
            },
            is_streaming: true,
            viewer_count: 2,
            last_viewed: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], "cam1");
        assert_eq!(json["rtspUrl"], "rtsp://x/1");
        assert_eq!(json["isStreaming"], true);
        assert_eq!(json["viewerCount"], 2);
    }

    #[test]
    fn test_annotation_update_accepts_either_schema() {
        let roi_only: AnnotationUpdate = serde_json::from_str(r#"{"roi":[{"x":1,"y":2,"width":3,"height":4}]}"#).unwrap();
        assert!(roi_only.roi.is_some());
        assert!(roi_only.draw_elements.is_none());

        let elements_only: AnnotationUpdate = serde_json::from_str(
            r#"{"drawElements":[{"type":"polyline","points":[{"x":0,"y":0},{"x":9,"y":9}]}]}"#,
        )
        .unwrap();
        assert!(elements_only.roi.is_none());
        assert_eq!(elements_only.draw_elements.unwrap().len(), 1);
    }
}
