use image::{ImageFormat, RgbaImage};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One message from the decoder to its pipeline supervisor.
pub enum FrameMsg {
    Frame(RgbaImage),
    Error(String),
}

pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
pub const IEND_TRAILER: [u8; 8] = [0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82];

const READ_CHUNK_SIZE: usize = 8192;
/// Cap on buffered bytes without a complete frame. Past this the assembler
/// resynchronizes to the next signature or discards everything.
const MAX_PENDING_BYTES: usize = 2 * 1024 * 1024;

/// Reassembles complete PNG images out of an arbitrary byte stream.
///
/// A frame starts at the PNG signature and ends with the IEND chunk trailer.
/// Bytes before the first signature are dropped; an incomplete frame larger
/// than [`MAX_PENDING_BYTES`] triggers resynchronization so malformed input
/// cannot grow the buffer without bound.
#[derive(Default)]
pub struct PngAssembler {
    buf: Vec<u8>,
    started: bool,
    // Offset the next IEND search resumes from, so large frames arriving in
    // many small chunks are not rescanned from the beginning each time.
    scan_from: usize,
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

impl PngAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every complete PNG it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.started {
                match find(&self.buf, &PNG_SIGNATURE, 0) {
                    Some(offset) => {
                        if offset > 0 {
                            self.buf.drain(..offset);
                        }
                        self.started = true;
                        self.scan_from = PNG_SIGNATURE.len();
                    }
                    None => {
                        // Keep a tail that could be the head of a signature
                        // split across chunks.
                        let keep = PNG_SIGNATURE.len() - 1;
                        if self.buf.len() > keep {
                            self.buf.drain(..self.buf.len() - keep);
                        }
                        break;
                    }
                }
            }

            match find(&self.buf, &IEND_TRAILER, self.scan_from) {
                Some(offset) => {
                    let end = offset + IEND_TRAILER.len();
                    frames.push(self.buf.drain(..end).collect());
                    self.started = false;
                    self.scan_from = 0;
                }
                None => {
                    if self.buf.len() > MAX_PENDING_BYTES {
                        self.resync();
                        if self.started {
                            continue;
                        }
                    } else {
                        self.scan_from = self
                            .buf
                            .len()
                            .saturating_sub(IEND_TRAILER.len() - 1)
                            .max(PNG_SIGNATURE.len());
                    }
                    break;
                }
            }
        }

        frames
    }

    fn resync(&mut self) {
        match find(&self.buf, &PNG_SIGNATURE, 1) {
            Some(offset) => {
                debug!("Resynchronizing PNG stream, dropping {} bytes", offset);
                self.buf.drain(..offset);
                self.scan_from = PNG_SIGNATURE.len();
            }
            None => {
                debug!("No PNG signature in {} pending bytes, discarding", self.buf.len());
                self.buf.clear();
                self.started = false;
                self.scan_from = 0;
            }
        }
    }
}

/// Pulls one RTSP feed through the external decoder and emits decoded frames.
///
/// Spawns ffmpeg configured for TCP transport, one-in-five frame selection
/// and PNG output on stdout, then drives a [`PngAssembler`] over the pipe.
/// Every complete PNG becomes a `Frame` message; malformed ones become
/// `Error` messages and the stream continues. Does not restart on its own;
/// the pipeline supervisor owns the retry policy.
pub async fn run(rtsp_url: &str, tx: mpsc::Sender<FrameMsg>, cancel: CancellationToken) {
    let mut child = match Command::new("ffmpeg")
        .args([
            "-rtsp_transport",
            "tcp",
            "-i",
            rtsp_url,
            "-analyzeduration",
            "1000000",
            "-probesize",
            "1000000",
            "-vf",
            "select=not(mod(n\\,5))",
            "-fps_mode",
            "vfr",
            "-c:v",
            "png",
            "-f",
            "image2pipe",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let _ = tx.send(FrameMsg::Error(format!("failed to start decoder: {}", e))).await;
            return;
        }
    };

    let Some(mut stdout) = child.stdout.take() else {
        let _ = tx.send(FrameMsg::Error("failed to open decoder stdout".to_string())).await;
        return;
    };
    let Some(mut stderr) = child.stderr.take() else {
        let _ = tx.send(FrameMsg::Error("failed to open decoder stderr".to_string())).await;
        return;
    };

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let mut assembler = PngAssembler::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                stderr_task.abort();
                return;
            }
            read = stdout.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => {
                    for png in assembler.push(&chunk[..n]) {
                        let msg = match image::load_from_memory_with_format(&png, ImageFormat::Png) {
                            Ok(img) => FrameMsg::Frame(img.to_rgba8()),
                            Err(e) => FrameMsg::Error(format!("failed to decode PNG: {}", e)),
                        };
                        if tx.send(msg).await.is_err() {
                            // Supervisor is gone; reap the child and bail.
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                            stderr_task.abort();
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(FrameMsg::Error(format!("pipe read error: {}", e))).await;
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return;
                }
            }
        }
    }

    // EOF: report how the decoder went away.
    let status = child.wait().await;
    let stderr_buf = stderr_task.await.unwrap_or_default();
    let mut message = match status {
        Ok(status) => format!("decoder exited: {}", status),
        Err(e) => format!("decoder wait failed: {}", e),
    };
    if !stderr_buf.is_empty() {
        let text = String::from_utf8_lossy(&stderr_buf);
        let tail = text.lines().rev().take(5).collect::<Vec<_>>();
        let tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
        message = format!("{}: {}", message, tail);
    }
    let _ = tx.send(FrameMsg::Error(message)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn tiny_png(r: u8) -> Vec<u8> {
        let mut img = RgbaImage::new(2, 2);
        for pixel in img.pixels_mut() {
            *pixel = Rgba([r, 0, 0, 255]);
        }
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_two_concatenated_frames() {
        let a = tiny_png(10);
        let b = tiny_png(200);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut assembler = PngAssembler::new();
        let frames = assembler.push(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], a);
        assert_eq!(frames[1], b);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let png = tiny_png(42);
        let mut assembler = PngAssembler::new();
        let mut frames = Vec::new();
        for chunk in png.chunks(7) {
            frames.extend(assembler.push(chunk));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], png);
    }

    #[test]
    fn test_truncated_frame_yields_nothing() {
        let png = tiny_png(42);
        let mut assembler = PngAssembler::new();
        let frames = assembler.push(&png[..png.len() - 4]);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_garbage_before_signature_is_skipped() {
        let png = tiny_png(42);
        let mut stream = b"not a png at all".to_vec();
        stream.extend_from_slice(&png);

        let mut assembler = PngAssembler::new();
        let frames = assembler.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], png);
    }

    #[test]
    fn test_oversize_pending_resyncs_to_embedded_frame() {
        let png = tiny_png(42);
        let (head, tail) = png.split_at(10);
        let mut assembler = PngAssembler::new();

        // A signature that never completes, filler well past the pending
        // cap, then the start of a real frame. The valve must drop the
        // filler and resynchronize onto the embedded signature.
        let mut stream = PNG_SIGNATURE.to_vec();
        stream.extend_from_slice(&vec![0xABu8; MAX_PENDING_BYTES + 4096]);
        stream.extend_from_slice(head);
        assert!(assembler.push(&stream).is_empty());

        let frames = assembler.push(tail);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], png);
    }

    #[test]
    fn test_oversize_pending_discards_and_recovers() {
        let png = tiny_png(42);
        let mut assembler = PngAssembler::new();

        let mut stream = PNG_SIGNATURE.to_vec();
        stream.extend_from_slice(&vec![0xCDu8; MAX_PENDING_BYTES + 4096]);
        assert!(assembler.push(&stream).is_empty());

        // A clean frame after the discard still comes through.
        let frames = assembler.push(&png);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], png);
    }

    #[test]
    fn test_decoded_frames_round_trip() {
        let png = tiny_png(42);
        let mut assembler = PngAssembler::new();
        let frames = assembler.push(&png);
        let img = image::load_from_memory_with_format(&frames[0], ImageFormat::Png).unwrap();
        assert_eq!(img.to_rgba8().get_pixel(0, 0), &Rgba([42, 0, 0, 255]));
    }

    #[test]
    fn test_corrupted_frame_fails_decode_but_next_succeeds() {
        let mut bad = tiny_png(42);
        let mid = bad.len() / 2;
        bad[mid] ^= 0xFF;
        let good = tiny_png(7);

        let mut stream = bad.clone();
        stream.extend_from_slice(&good);

        let mut assembler = PngAssembler::new();
        let frames = assembler.push(&stream);
        assert_eq!(frames.len(), 2);
        assert!(image::load_from_memory_with_format(&frames[0], ImageFormat::Png).is_err());
        assert!(image::load_from_memory_with_format(&frames[1], ImageFormat::Png).is_ok());
    }
}
