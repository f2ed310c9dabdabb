//! Cropper (§4.5): extracts one viewer's rectangular sub-region from the
//! broadcaster's most recent source frame, encodes it to VP8, and writes
//! the result to that viewer's WebRTC video track. Capped at 30fps with a
//! drop-old/no-queuing policy — each tick reads whatever frame is most
//! recent, never a backlog.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use wall_protocol::Rectangle;

use crate::encoder::Vp8Encoder;
use crate::source::{FrameFeed, SourceFrame};

/// A cropped RGB frame ready to be encoded.
#[derive(Debug, Clone)]
pub struct CroppedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Extracts `region` from `frame`, re-clipping to the frame's actual
/// bounds. Returns `None` if the clipped result has zero area (§4.5 edge
/// case) — the Cropper produces no frame for this tick rather than
/// emitting a degenerate sample.
pub fn crop(frame: &SourceFrame, region: Rectangle) -> Option<CroppedFrame> {
    let x = region.x.min(frame.width);
    let y = region.y.min(frame.height);
    let width = region.width.min(frame.width.saturating_sub(x));
    let height = region.height.min(frame.height.saturating_sub(y));

    if width == 0 || height == 0 {
        return None;
    }

    let mut out = Vec::with_capacity(width as usize * height as usize * 3);
    let stride = frame.width as usize * 3;
    for row in 0..height {
        let row_start = (y + row) as usize * stride + x as usize * 3;
        let row_end = row_start + width as usize * 3;
        out.extend_from_slice(&frame.data[row_start..row_end]);
    }

    Some(CroppedFrame {
        width,
        height,
        data: out,
    })
}

/// One per bound Viewer Session. Owns the producer task that crops,
/// encodes, and emits frames for as long as the session has a region.
///
/// Bound to a fixed output size at construction (the encoder pipeline's
/// caps are sized to it); a region update that keeps the same width/height
/// is a pure offset move handled by `retarget`, but a dimension change
/// requires a new `Cropper` — see `ViewerSession::apply_region`.
pub struct Cropper {
    width: u32,
    height: u32,
    region_tx: watch::Sender<Rectangle>,
    handle: tokio::task::JoinHandle<()>,
}

impl Cropper {
    pub fn bind(
        feed: FrameFeed,
        region: Rectangle,
        track: Arc<TrackLocalStaticSample>,
        frame_rate_cap: u32,
    ) -> anyhow::Result<Self> {
        let encoder = Vp8Encoder::new(region.width, region.height, frame_rate_cap)?;
        let (region_tx, region_rx) = watch::channel(region);
        let handle = tokio::spawn(run_producer(feed, region_rx, track, encoder, frame_rate_cap));
        Ok(Self {
            width: region.width,
            height: region.height,
            region_tx,
            handle,
        })
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Atomically swap the bound region; the producer task picks it up on
    /// its next tick, with no lock contention against the hot frame-copy
    /// path (§4.5). Only valid for a same-dimensions move — callers must
    /// rebuild the `Cropper` for a dimension change.
    pub fn retarget(&self, region: Rectangle) {
        debug_assert_eq!((region.width, region.height), (self.width, self.height));
        let _ = self.region_tx.send(region);
    }

    pub async fn close(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn run_producer(
    mut feed: FrameFeed,
    mut region_rx: watch::Receiver<Rectangle>,
    track: Arc<TrackLocalStaticSample>,
    encoder: Vp8Encoder,
    frame_rate_cap: u32,
) {
    let period = Duration::from_secs_f64(1.0 / frame_rate_cap.max(1) as f64);
    let mut tick = interval(period);
    let mut pts: u64 = 0;

    loop {
        tick.tick().await;

        if encoder.has_error() {
            tracing::warn!("VP8 encoder pipeline errored, stopping cropper");
            break;
        }

        let region = *region_rx.borrow_and_update();
        let Some(frame) = feed.borrow_and_update().clone() else {
            continue;
        };

        let Some(cropped) = crop(&frame, region) else {
            continue;
        };

        if let Err(e) = encoder.encode_frame(cropped.data, pts) {
            tracing::debug!("failed to push frame to encoder: {e}");
            continue;
        }
        pts += period.as_nanos() as u64;

        match encoder.pull_encoded() {
            Ok(Some(encoded)) => {
                let sample = webrtc::media::Sample {
                    data: bytes::Bytes::from(encoded),
                    duration: period,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    tracing::debug!("cropper sample write failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("VP8 encoder disconnected: {e}");
                break;
            }
        }
    }
}
