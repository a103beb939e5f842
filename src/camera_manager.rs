use tracing::info;

use crate::config::{Camera, DrawElement, Roi};
use crate::errors::Result;
use crate::AppState;

impl AppState {
    pub async fn add_camera(&self, camera: Camera) -> Result<()> {
        let id = camera.id.clone();
        self.registry.add(camera).await?;
        info!("Camera '{}' added", id);
        Ok(())
    }

    /// Replaces a camera's configuration and stops its stream so the next
    /// subscriber starts a pipeline against the new URL and enabled flag.
    pub async fn update_camera(&self, id: &str, camera: Camera) -> Result<()> {
        self.registry.update(id, camera).await?;
        if self.streams.stop(id).is_ok() {
            info!("Stopped stream for updated camera '{}'", id);
        }
        info!("Camera '{}' updated", id);
        Ok(())
    }

    /// Swaps annotation lists in place. The running pipeline reads the
    /// registry per frame, so the stream is not interrupted.
    pub async fn update_annotations(
        &self,
        id: &str,
        roi: Option<Vec<Roi>>,
        draw_elements: Option<Vec<DrawElement>>,
    ) -> Result<()> {
        self.registry.update_annotations(id, roi, draw_elements).await
    }

    pub async fn delete_camera(&self, id: &str) -> Result<()> {
        self.registry.delete(id).await?;
        if self.streams.stop(id).is_ok() {
            info!("Stopped stream for deleted camera '{}'", id);
        }
        info!("Camera '{}' removed", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::CameraRegistry;
    use crate::streams::StreamManager;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn state(cameras: Vec<Camera>) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(CameraRegistry::new(
            Config { web_port: String::new(), cameras },
            PathBuf::from(dir.path()).join("config.json"),
        ));
        let streams = Arc::new(StreamManager::new(registry.clone()));
        (AppState { registry, streams }, dir)
    }

    fn camera(id: &str) -> Camera {
        Camera {
            id: id.to_string(),
            name: id.to_string(),
            rtsp_url: "rtsp://127.0.0.1:554/test".to_string(),
            roi: Vec::new(),
            draw_elements: Vec::new(),
            enabled: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_stops_running_stream() {
        let (state, _dir) = state(vec![camera("cam1")]);
        state.streams.attach("cam1").await.unwrap();
        assert!(state.streams.is_running("cam1"));

        let mut updated = camera("cam1");
        updated.enabled = false;
        state.update_camera("cam1", updated).await.unwrap();
        assert!(!state.streams.is_running("cam1"));

        // Disabled camera cannot be re-attached.
        assert!(state.streams.attach("cam1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_stops_stream_and_forgets_camera() {
        let (state, _dir) = state(vec![camera("cam1")]);
        state.streams.attach("cam1").await.unwrap();

        state.delete_camera("cam1").await.unwrap();
        assert!(!state.streams.is_running("cam1"));
        assert!(state.registry.get("cam1").await.is_err());
        assert!(state.streams.attach("cam1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_annotation_update_keeps_stream_alive() {
        let (state, _dir) = state(vec![camera("cam1")]);
        state.streams.attach("cam1").await.unwrap();

        state
            .update_annotations("cam1", Some(vec![Roi { x: 1, y: 1, width: 5, height: 5 }]), None)
            .await
            .unwrap();
        assert!(state.streams.is_running("cam1"));
        assert_eq!(state.registry.get("cam1").await.unwrap().roi.len(), 1);
    }
}
