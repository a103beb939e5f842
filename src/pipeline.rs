use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::annotate;
use crate::broadcast::MjpegBroadcaster;
use crate::decoder::{self, FrameMsg};
use crate::registry::CameraRegistry;

const RESTART_BACKOFF: Duration = Duration::from_secs(5);
const FRAME_CHANNEL_CAPACITY: usize = 4;
pub const JPEG_QUALITY: u8 = 80;

/// Launches the supervisor task keeping one camera's feed alive.
///
/// The task respawns the decoder with a fixed backoff whenever it exits and
/// terminates only when `cancel` fires (or the camera disappears from the
/// registry). Annotations are read from the registry per frame, so edits
/// show up without a restart.
pub fn spawn(
    camera_id: String,
    registry: Arc<CameraRegistry>,
    broadcaster: Arc<MjpegBroadcaster>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(camera_id, registry, broadcaster, cancel))
}

async fn run(
    camera_id: String,
    registry: Arc<CameraRegistry>,
    broadcaster: Arc<MjpegBroadcaster>,
    cancel: CancellationToken,
) {
    loop {
        let camera = match registry.get(&camera_id).await {
            Ok(camera) => camera,
            Err(_) => {
                info!("Camera '{}' no longer configured, stopping pipeline", camera_id);
                break;
            }
        };

        let (tx, mut rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let decoder_cancel = cancel.child_token();
        let rtsp_url = camera.rtsp_url.clone();
        let decoder_task =
            tokio::spawn(async move { decoder::run(&rtsp_url, tx, decoder_cancel).await });

        while let Some(msg) = rx.recv().await {
            match msg {
                FrameMsg::Error(e) => error!("Error from camera {}: {}", camera_id, e),
                FrameMsg::Frame(frame) => {
                    publish_frame(&camera_id, &registry, &broadcaster, frame).await;
                }
            }
        }
        let _ = decoder_task.await;

        if cancel.is_cancelled() {
            break;
        }
        info!("Restarting RTSP feed for camera: {}", camera_id);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(RESTART_BACKOFF) => {}
        }
    }
    debug!("Pipeline terminated for camera: {}", camera_id);
}

/// Annotates one frame against the camera's current configuration and hands
/// the JPEG to the broadcaster. Encode failures are dropped; the next frame
/// carries the update.
async fn publish_frame(
    camera_id: &str,
    registry: &CameraRegistry,
    broadcaster: &MjpegBroadcaster,
    mut frame: RgbaImage,
) {
    let camera = match registry.get(camera_id).await {
        Ok(camera) => camera,
        // Deleted mid-flight; the stream is about to be stopped anyway.
        Err(_) => return,
    };

    if !camera.roi.is_empty() {
        annotate::draw_rois(&mut frame, &camera.roi);
    }
    if !camera.draw_elements.is_empty() {
        annotate::draw_elements(&mut frame, &camera.draw_elements);
    }

    match encode_jpeg(frame) {
        Ok(jpeg) => {
            broadcaster.publish(jpeg);
        }
        Err(e) => debug!("Dropping frame for camera {}: JPEG encode failed: {}", camera_id, e),
    }
}

pub fn encode_jpeg(frame: RgbaImage) -> image::ImageResult<Bytes> {
    let rgb = DynamicImage::ImageRgba8(frame).to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_encode_jpeg_produces_jfif_bytes() {
        let frame = RgbaImage::from_pixel(16, 16, Rgba([0, 128, 255, 255]));
        let jpeg = encode_jpeg(frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }
}
