use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::warn;
use url::Url;

use crate::config::{Camera, Config, DrawElement, Roi};
use crate::errors::{Result, StreamError};

/// Authoritative in-memory camera list.
///
/// All reads copy out under a shared lock; mutations take the exclusive
/// lock, apply, and rewrite the backing config file before returning. A
/// failed rewrite is logged and the in-memory change stands, so a broken
/// disk degrades durability rather than the live streams.
pub struct CameraRegistry {
    config: RwLock<Config>,
    config_path: PathBuf,
}

impl CameraRegistry {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        Self {
            config: RwLock::new(config),
            config_path,
        }
    }

    pub async fn list(&self) -> Vec<Camera> {
        self.config.read().await.cameras.clone()
    }

    pub async fn get(&self, id: &str) -> Result<Camera> {
        self.config
            .read()
            .await
            .cameras
            .iter()
            .find(|camera| camera.id == id)
            .cloned()
            .ok_or_else(|| StreamError::unknown_camera(id))
    }

    pub async fn add(&self, camera: Camera) -> Result<()> {
        validate(&camera)?;
        let mut config = self.config.write().await;
        if config.cameras.iter().any(|existing| existing.id == camera.id) {
            return Err(StreamError::duplicate_id(&camera.id));
        }
        config.cameras.push(camera);
        self.persist(&config);
        Ok(())
    }

    /// Replaces the record, forcing the id to stay `id`.
    pub async fn update(&self, id: &str, mut camera: Camera) -> Result<()> {
        camera.id = id.to_string();
        validate(&camera)?;
        let mut config = self.config.write().await;
        let slot = config
            .cameras
            .iter_mut()
            .find(|existing| existing.id == id)
            .ok_or_else(|| StreamError::unknown_camera(id))?;
        *slot = camera;
        self.persist(&config);
        Ok(())
    }

    /// Atomically replaces annotation lists without touching the rest of the
    /// record; running pipelines pick the change up on their next frame.
    pub async fn update_annotations(
        &self,
        id: &str,
        roi: Option<Vec<Roi>>,
        draw_elements: Option<Vec<DrawElement>>,
    ) -> Result<()> {
        let mut config = self.config.write().await;
        let camera = config
            .cameras
            .iter_mut()
            .find(|existing| existing.id == id)
            .ok_or_else(|| StreamError::unknown_camera(id))?;
        if let Some(roi) = roi {
            camera.roi = roi;
        }
        if let Some(draw_elements) = draw_elements {
            camera.draw_elements = draw_elements;
        }
        self.persist(&config);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut config = self.config.write().await;
        let index = config
            .cameras
            .iter()
            .position(|existing| existing.id == id)
            .ok_or_else(|| StreamError::unknown_camera(id))?;
        config.cameras.remove(index);
        self.persist(&config);
        Ok(())
    }

    fn persist(&self, config: &Config) {
        if let Err(e) = config.save(&self.config_path) {
            warn!("Failed to save config to {}: {}", self.config_path.display(), e);
        }
    }
}

fn validate(camera: &Camera) -> Result<()> {
    if camera.id.is_empty() {
        return Err(StreamError::bad_input("camera id must not be empty"));
    }
    if camera.rtsp_url.is_empty() {
        return Err(StreamError::bad_input("rtspUrl must not be empty"));
    }
    Url::parse(&camera.rtsp_url)
        .map_err(|e| StreamError::bad_input(format!("invalid rtspUrl: {}", e)))?;
    Ok(())
}
