use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::MjpegBroadcaster;
use crate::errors::{Result, StreamError};
use crate::pipeline;
use crate::registry::CameraRegistry;

/// How long a stream with no viewers keeps running before it is stopped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct ViewerState {
    viewer_count: usize,
    last_viewed: DateTime<Utc>,
    stop_timer: Option<JoinHandle<()>>,
    // Set once an idle stop or explicit stop has claimed this entry. An
    // attach that observes it must retry against a fresh entry.
    stopped: bool,
}

pub struct StreamInfo {
    camera_id: String,
    broadcaster: Arc<MjpegBroadcaster>,
    cancel: CancellationToken,
    state: Mutex<ViewerState>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamStatus {
    pub is_streaming: bool,
    pub viewer_count: usize,
    pub last_viewed: Option<DateTime<Utc>>,
}

/// Reference-counts HTTP viewers per camera and owns the lifecycle of each
/// pipeline.
///
/// First viewer starts the pipeline, every arrival cancels a pending stop,
/// and the last departure arms a one-shot idle timer. All transitions over
/// `viewer_count` and `stop_timer` hold the stream's own mutex; the timer
/// re-checks the count under that mutex before it tears anything down, so a
/// late attach always wins over a concurrently firing stop.
pub struct StreamManager {
    registry: Arc<CameraRegistry>,
    streams: DashMap<String, Arc<StreamInfo>>,
    idle_timeout: Duration,
}

impl StreamManager {
    pub fn new(registry: Arc<CameraRegistry>) -> Self {
        Self::with_idle_timeout(registry, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(registry: Arc<CameraRegistry>, idle_timeout: Duration) -> Self {
        Self {
            registry,
            streams: DashMap::new(),
            idle_timeout,
        }
    }

    /// Registers a viewer, starting the pipeline if this is the first one.
    /// Returns the broadcaster to subscribe to.
    pub async fn attach(self: &Arc<Self>, camera_id: &str) -> Result<Arc<MjpegBroadcaster>> {
        loop {
            if let Some(stream) = self.get_stream(camera_id) {
                {
                    let mut state = stream.state.lock();
                    if !state.stopped {
                        state.viewer_count += 1;
                        state.last_viewed = Utc::now();
                        if let Some(timer) = state.stop_timer.take() {
                            timer.abort();
                        }
                        info!(
                            "Viewer added to camera {}, total viewers: {}",
                            camera_id, state.viewer_count
                        );
                        return Ok(stream.broadcaster.clone());
                    }
                }
                // Lost the race against an idle stop mid-teardown; let it
                // finish and start fresh.
                tokio::task::yield_now().await;
                continue;
            }

            match self.start_pipeline(camera_id, 1).await? {
                Some(stream) => {
                    info!("Viewer added to camera {}, total viewers: 1", camera_id);
                    return Ok(stream.broadcaster.clone());
                }
                // Another attach created the entry first; go count ourselves
                // against it.
                None => continue,
            }
        }
    }

    /// Unregisters a viewer. At zero viewers the idle-stop timer is armed.
    pub fn detach(self: &Arc<Self>, camera_id: &str) {
        let Some(stream) = self.get_stream(camera_id) else {
            debug!("Detach for camera {} with no running stream", camera_id);
            return;
        };
        let mut state = stream.state.lock();
        if state.viewer_count > 0 {
            state.viewer_count -= 1;
        }
        info!(
            "Viewer removed from camera {}, remaining viewers: {}",
            camera_id, state.viewer_count
        );
        if state.viewer_count == 0 && !state.stopped {
            self.arm_stop_timer(&mut state, camera_id);
        }
    }

    /// Admin/boot start. The stream comes up with zero viewers, so the idle
    /// timer is armed immediately; it stops itself unless someone watches.
    pub async fn start(self: &Arc<Self>, camera_id: &str) -> Result<()> {
        if self.streams.contains_key(camera_id) {
            info!("Stream already running for camera: {}", camera_id);
            return Ok(());
        }
        if let Some(stream) = self.start_pipeline(camera_id, 0).await? {
            let mut state = stream.state.lock();
            if state.viewer_count == 0 {
                self.arm_stop_timer(&mut state, camera_id);
            }
        }
        Ok(())
    }

    /// Tears the stream down: cancels the pipeline, disconnects viewers.
    /// Missing entries report `NotRunning`; callers that treat stop as
    /// idempotent ignore it.
    pub fn stop(&self, camera_id: &str) -> Result<()> {
        let Some((_, stream)) = self.streams.remove(camera_id) else {
            return Err(StreamError::not_running(camera_id));
        };
        let mut state = stream.state.lock();
        state.stopped = true;
        if let Some(timer) = state.stop_timer.take() {
            timer.abort();
        }
        drop(state);
        stream.cancel.cancel();
        stream.broadcaster.close();
        info!("Stopped stream for camera: {}", camera_id);
        Ok(())
    }

    pub fn is_running(&self, camera_id: &str) -> bool {
        self.streams.contains_key(camera_id)
    }

    pub fn status(&self, camera_id: &str) -> StreamStatus {
        match self.get_stream(camera_id) {
            Some(stream) => {
                let state = stream.state.lock();
                StreamStatus {
                    is_streaming: true,
                    viewer_count: state.viewer_count,
                    last_viewed: Some(state.last_viewed),
                }
            }
            None => StreamStatus::default(),
        }
    }

    fn get_stream(&self, camera_id: &str) -> Option<Arc<StreamInfo>> {
        self.streams.get(camera_id).map(|entry| entry.value().clone())
    }

    async fn start_pipeline(
        self: &Arc<Self>,
        camera_id: &str,
        initial_viewers: usize,
    ) -> Result<Option<Arc<StreamInfo>>> {
        let camera = self.registry.get(camera_id).await?;
        if !camera.enabled {
            return Err(StreamError::disabled(camera_id));
        }

        match self.streams.entry(camera_id.to_string()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let broadcaster = Arc::new(MjpegBroadcaster::new());
                let cancel = CancellationToken::new();
                pipeline::spawn(
                    camera_id.to_string(),
                    self.registry.clone(),
                    broadcaster.clone(),
                    cancel.clone(),
                );
                let stream = Arc::new(StreamInfo {
                    camera_id: camera_id.to_string(),
                    broadcaster,
                    cancel,
                    state: Mutex::new(ViewerState {
                        viewer_count: initial_viewers,
                        last_viewed: Utc::now(),
                        stop_timer: None,
                        stopped: false,
                    }),
                });
                slot.insert(stream.clone());
                info!("Started stream for camera: {} ({})", camera.id, camera.name);
                Ok(Some(stream))
            }
        }
    }

    // Caller holds the stream's state lock.
    fn arm_stop_timer(self: &Arc<Self>, state: &mut ViewerState, camera_id: &str) {
        if let Some(old) = state.stop_timer.take() {
            old.abort();
        }
        let manager = self.clone();
        let camera_id = camera_id.to_string();
        let idle_timeout = self.idle_timeout;
        state.stop_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            manager.idle_stop(&camera_id, idle_timeout);
        }));
    }

    fn idle_stop(&self, camera_id: &str, idle_timeout: Duration) {
        let Some(stream) = self.get_stream(camera_id) else {
            return;
        };
        let mut state = stream.state.lock();
        if state.viewer_count > 0 {
            // A viewer re-attached while this timer was in flight.
            return;
        }
        state.stopped = true;
        state.stop_timer = None;
        self.streams.remove(&stream.camera_id);
        drop(state);
        stream.cancel.cancel();
        stream.broadcaster.close();
        info!(
            "No viewers for {:?}, stopping stream for camera: {}",
            idle_timeout, camera_id
        );
    }
}
