//! MJPEG stream for `GET /video_feed`
//!
//! Each viewer gets its own [`StreamEncoder`] that pulls the latest frame
//! from the shared cell at a fixed cadence. Browsers render the response
//! natively with `<img src="/video_feed">`.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Policy;
use crate::error::EncodeError;
use crate::frame::Frame;
use crate::state::SharedState;

/// Multipart boundary between JPEG parts
pub const BOUNDARY: &str = "frame";

/// Compress an RGB frame to JPEG
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Bytes, EncodeError> {
    let mut out = Vec::with_capacity(frame.pixels().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
        frame.pixels(),
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(Bytes::from(out))
}

/// Wrap one JPEG image as a multipart part
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let head = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut buf = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Per-viewer encoder over the shared cell
pub struct StreamEncoder {
    state: SharedState,
    quality: u8,
    interval: Duration,
    cancel: CancellationToken,
    blank: Frame,
    /// Generation and part bytes of the last encoded frame
    cached: Option<(u64, Bytes)>,
}

impl StreamEncoder {
    pub fn new(state: SharedState, policy: &Policy, cancel: CancellationToken) -> Self {
        Self {
            state,
            quality: policy.jpeg_quality,
            interval: policy.stream_interval,
            cancel,
            blank: Frame::blank(policy.frame_width, policy.frame_height),
            cached: None,
        }
    }

    /// Encode the current frame (a blank one before the first write) as a
    /// complete multipart part. An unchanged frame is not re-encoded.
    pub async fn next_chunk(&mut self) -> Result<Bytes, EncodeError> {
        // generation 0 stands for the blank placeholder
        let (frame, generation) = self
            .state
            .read_frame_versioned()
            .unwrap_or_else(|| (self.blank.clone(), 0));

        if let Some((cached_generation, chunk)) = &self.cached {
            if *cached_generation == generation {
                return Ok(chunk.clone());
            }
        }

        let quality = self.quality;
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality))
            .await
            .map_err(|e| EncodeError::Task(e.to_string()))??;

        let chunk = multipart_chunk(&jpeg);
        self.cached = Some((generation, chunk.clone()));
        Ok(chunk)
    }

    /// Endless stream of parts, one per interval, until shutdown. Ticks whose
    /// encode fails are skipped.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        futures_util::stream::unfold((self, ticker), |(mut encoder, mut ticker)| async move {
            loop {
                if !wait_tick(&encoder.cancel, &mut ticker).await {
                    debug!("MJPEG stream ended by shutdown");
                    return None;
                }
                match encoder.next_chunk().await {
                    Ok(chunk) => return Some((Ok(chunk), (encoder, ticker))),
                    Err(e) => warn!("Skipping MJPEG frame: {}", e),
                }
            }
        })
    }

    /// Streaming `multipart/x-mixed-replace` response
    pub fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [
                (
                    header::CONTENT_TYPE,
                    format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
                ),
                (
                    header::CACHE_CONTROL,
                    "no-cache, no-store, must-revalidate".to_string(),
                ),
                (header::PRAGMA, "no-cache".to_string()),
                (header::EXPIRES, "0".to_string()),
            ],
            Body::from_stream(self.into_stream()),
        )
            .into_response()
    }
}

/// False once shutdown was requested
async fn wait_tick(cancel: &CancellationToken, ticker: &mut Interval) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = ticker.tick() => true,
    }
}
