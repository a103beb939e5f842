use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post, put};
use clap::Parser;
use tracing::{info, warn};

mod annotate;
mod broadcast;
mod camera_manager;
mod config;
mod decoder;
mod errors;
mod handlers;
mod pipeline;
mod registry;
mod streams;

use config::Config;
use registry::CameraRegistry;
use streams::StreamManager;

#[derive(Parser, Debug, Clone)]
#[command(name = "rtsp-mjpeg-gateway", about = "Multi-camera RTSP to MJPEG streaming gateway")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CameraRegistry>,
    pub streams: Arc<StreamManager>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("rtsp_mjpeg_gateway=debug,info")
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config file {}", args.config.display()))?;
    let addr = config.listen_addr();
    let cameras = config.cameras.clone();

    let registry = Arc::new(CameraRegistry::new(config, args.config.clone()));
    let streams = Arc::new(StreamManager::new(registry.clone()));
    let state = AppState { registry, streams: streams.clone() };

    // Bring enabled cameras up before accepting viewers; each one idles
    // back out after the timeout unless somebody watches.
    for camera in &cameras {
        if camera.enabled {
            if let Err(e) = streams.start(&camera.id).await {
                warn!("Failed to start stream for camera {}: {}", camera.id, e);
            }
        }
    }

    let app = axum::Router::new()
        .route("/", get(handlers::root_handler))
        .route("/config", get(handlers::config_page))
        .route("/monitor", get(handlers::monitor_page))
        .nest_service("/static", tower_http::services::ServeDir::new("static"))
        .route("/api/cameras", get(handlers::api_list_cameras).post(handlers::api_add_camera))
        .route(
            "/api/cameras/:id",
            put(handlers::api_update_camera).delete(handlers::api_delete_camera),
        )
        .route("/api/cameras/:id/roi", post(handlers::api_update_annotations))
        .route("/api/cameras/:id/start", post(handlers::api_start_stream))
        .route("/api/cameras/:id/stop", post(handlers::api_stop_stream))
        .route("/api/status", get(handlers::api_status))
        .route("/stream/:id", get(handlers::stream_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    info!("Starting multi-stream server on {}", addr);
    info!("Configuration page: http://{}/config", addr);
    for camera in &cameras {
        if camera.enabled {
            info!("  - {}: http://{}/stream/{}", camera.name, addr, camera.id);
        }
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
