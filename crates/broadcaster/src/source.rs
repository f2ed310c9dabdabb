//! Frame source abstraction (§4.5, expanded): a pluggable producer of raw
//! frames feeding every viewer's Cropper. Generalized from
//! `beam-agent::capture::ScreenCapture`'s pooled-buffer X11 SHM design into
//! a `FrameSource` trait, so the Cropper never depends on X11 directly and
//! the broadcaster can run against a screen, a camera, or (in tests) a
//! synthetic pattern.
//!
//! Real screen/camera capture backends are ambient OS integration (§1) and
//! are not built here; `TestPatternSource` is both the integration-test
//! fixture and, for now, the only shipped `FrameSource`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration};

/// One captured frame: packed RGB, row-major, no row padding.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

/// Shared read handle onto the most recent frame, `None` until the first
/// one arrives. Croppers clone this receiver — many readers, drop-old, no
/// queuing (§4.5's latest-frame-wins policy).
pub type FrameFeed = watch::Receiver<Option<SourceFrame>>;

/// A producer of frames for one broadcaster session. Implementors own
/// whatever capture backend they wrap; the Cropper only ever sees the
/// `FrameFeed` it subscribes to.
pub trait FrameSource: Send + Sync {
    fn subscribe(&self) -> FrameFeed;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// Synthetic color-cycling generator standing in for real screen/camera
/// capture. Used by integration tests exercising the Cropper/Viewer
/// Session pipeline without a display server.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    tx: watch::Sender<Option<SourceFrame>>,
}

impl TestPatternSource {
    pub fn start(width: u32, height: u32, frame_rate: u32) -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        let source = Arc::new(Self { width, height, tx });
        let producer = Arc::clone(&source);
        tokio::spawn(async move { producer.run(frame_rate).await });
        source
    }

    async fn run(&self, frame_rate: u32) {
        let period = Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64);
        let mut tick = interval(period);
        let mut phase: u8 = 0;
        loop {
            tick.tick().await;
            if self.tx.send(Some(self.render(phase))).is_err() {
                break;
            }
            phase = phase.wrapping_add(2);
        }
    }

    fn render(&self, phase: u8) -> SourceFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 3];
        for (i, px) in data.chunks_exact_mut(3).enumerate() {
            let x = (i % w) as u8;
            let y = (i / w) as u8;
            px[0] = x.wrapping_add(phase);
            px[1] = y.wrapping_add(phase);
            px[2] = phase;
        }
        SourceFrame {
            width: self.width,
            height: self.height,
            data: data.into(),
        }
    }
}

impl FrameSource for TestPatternSource {
    fn subscribe(&self) -> FrameFeed {
        self.tx.subscribe()
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pattern_source_emits_frames_of_requested_size() {
        let source = TestPatternSource::start(64, 48, 30);
        let mut feed = source.subscribe();
        feed.changed().await.unwrap();
        let frame = feed.borrow().clone().unwrap();
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
    }

    #[tokio::test]
    async fn subscribers_see_the_same_latest_frame() {
        let source = TestPatternSource::start(8, 8, 60);
        let mut a = source.subscribe();
        let mut b = source.subscribe();
        a.changed().await.unwrap();
        b.changed().await.unwrap();
        assert_eq!(a.borrow().as_ref().unwrap().data, b.borrow().as_ref().unwrap().data);
    }
}
