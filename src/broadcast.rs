use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Boundary string separating MJPEG parts. Unique enough to never occur
/// inside JPEG data.
const MJPEG_BOUNDARY: &str = "mjpeg_frame_9a4e2c81";

/// How many frames a slow client may fall behind before it skips ahead.
const CHANNEL_CAPACITY: usize = 4;

/// Single-writer, many-reader distribution point for one camera's JPEG
/// frames.
///
/// The pipeline publishes into the latest-frame slot and the broadcast
/// channel; each HTTP viewer holds a subscription. New subscribers are
/// primed with the latest frame so a freshly opened stream shows a picture
/// immediately instead of waiting out the sampling interval.
pub struct MjpegBroadcaster {
    tx: RwLock<broadcast::Sender<Bytes>>,
    latest: RwLock<Option<Bytes>>,
}

impl MjpegBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx: RwLock::new(tx),
            latest: RwLock::new(None),
        }
    }

    /// Replaces the latest-frame slot and fans the frame out to all current
    /// subscribers. Returns how many subscribers received it.
    pub fn publish(&self, jpeg: Bytes) -> usize {
        *self.latest.write() = Some(jpeg.clone());
        self.tx.read().send(jpeg).unwrap_or(0)
    }

    pub fn subscribe(&self) -> MjpegSubscriber {
        let rx = self.tx.read().subscribe();
        let first = self.latest.read().clone();
        MjpegSubscriber { first, rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.read().receiver_count()
    }

    /// Disconnects every subscriber by replacing the channel. Their streams
    /// end, which completes the HTTP response bodies.
    pub fn close(&self) {
        let (new_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        *self.tx.write() = new_tx;
        self.latest.write().take();
    }
}

impl Default for MjpegBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MjpegSubscriber {
    first: Option<Bytes>,
    rx: broadcast::Receiver<Bytes>,
}

impl MjpegSubscriber {
    /// Turns the subscription into a `multipart/x-mixed-replace` response.
    ///
    /// `guard` is held for the lifetime of the response body; its `Drop` is
    /// the exactly-once hook for viewer detach when the client goes away.
    pub fn into_response<G: Send + 'static>(self, guard: G) -> Response {
        let MjpegSubscriber { first, rx } = self;
        let head = tokio_stream::iter(first.map(encode_part));
        let live = BroadcastStream::new(rx).filter_map(|result| result.ok().map(encode_part));
        let stream = head.chain(live).map(move |part| {
            let _attached = &guard;
            Ok::<_, std::convert::Infallible>(part)
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
            )
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(header::PRAGMA, "no-cache")
            .body(Body::from_stream(stream))
            .expect("failed to build MJPEG response")
    }
}

fn encode_part(jpeg: Bytes) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(&jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}
