//! Viewer Session (§4.4): broadcaster-side per-viewer state machine owning
//! one `RTCPeerConnection`, its bound `Cropper`, and the pending-ICE queue
//! for candidates that arrive before the answer does.
//!
//! Concrete mapping onto `webrtc-rs`, grounded in `beam-agent::peer::WebRTCPeer`
//! (see `SPEC_FULL.md`'s `[NEGOTIATE]` section): one `RTCPeerConnection` per
//! session, the same `APIBuilder` + `MediaEngine` + `register_default_interceptors`
//! pipeline, but with the broadcaster as the designated SDP offerer and a
//! single VP8 video codec registered instead of the teacher's H.264/Opus
//! profile-matching dance.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use wall_protocol::Rectangle;

use crate::cropper::Cropper;
use crate::source::FrameFeed;

const VP8_MIME_TYPE: &str = "video/VP8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    OfferSent,
    Answered,
    Connected,
    Failed,
    Closed,
}

/// Candidates that arrive before the answer does, capacity-bounded with
/// drop-oldest-on-overflow (§4.4, §8: capacity 64).
struct PendingIce {
    queue: VecDeque<RTCIceCandidateInit>,
    capacity: usize,
}

impl PendingIce {
    fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, candidate: RTCIceCandidateInit) {
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
        }
        self.queue.push_back(candidate);
    }

    fn drain(&mut self) -> Vec<RTCIceCandidateInit> {
        self.queue.drain(..).collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }
}

pub struct ViewerSession {
    peer_connection: Arc<RTCPeerConnection>,
    sender: Arc<RTCRtpSender>,
    cropper: Mutex<Option<Cropper>>,
    pending_ice: Mutex<PendingIce>,
    state: Arc<Mutex<SessionState>>,
    pending_ice_capacity: usize,
}

impl ViewerSession {
    pub async fn create(
        ice_servers: Vec<RTCIceServer>,
        pending_ice_capacity: usize,
    ) -> anyhow::Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: VP8_MIME_TYPE.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = InterceptorRegistry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        // A placeholder 1x1 track until the first region binds a real
        // Cropper — `add_track` needs something to negotiate against.
        let placeholder = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: VP8_MIME_TYPE.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "wall".to_string(),
            "wall".to_string(),
        ));
        let sender = peer_connection
            .add_track(Arc::clone(&placeholder) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let state = Arc::new(Mutex::new(SessionState::Fresh));
        let state_for_callback = Arc::clone(&state);
        peer_connection.on_peer_connection_state_change(Box::new(move |pc_state| {
            let state = Arc::clone(&state_for_callback);
            Box::pin(async move {
                let mut guard = state.lock().await;
                *guard = match pc_state {
                    RTCPeerConnectionState::Connected => SessionState::Connected,
                    RTCPeerConnectionState::Failed => SessionState::Failed,
                    RTCPeerConnectionState::Closed => SessionState::Closed,
                    _ => *guard,
                };
            })
        }));

        Ok(Arc::new(Self {
            peer_connection,
            sender,
            cropper: Mutex::new(None),
            pending_ice: Mutex::new(PendingIce::new(pending_ice_capacity)),
            state,
            pending_ice_capacity,
        }))
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// §4.4: the broadcaster is always the SDP offerer, never the answerer.
    pub async fn create_offer(&self) -> anyhow::Result<String> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        *self.state.lock().await = SessionState::OfferSent;
        Ok(offer.sdp)
    }

    /// Waits up to `offer_timeout` (§5, default 15s) for the viewer's
    /// answer to arrive on `answer_rx`, rather than leaving the session
    /// hanging on a viewer that never responds.
    pub async fn await_answer(
        self: &Arc<Self>,
        mut answer_rx: tokio::sync::mpsc::Receiver<serde_json::Value>,
        offer_timeout: Duration,
    ) -> anyhow::Result<()> {
        let sdp = timeout(offer_timeout, answer_rx.recv())
            .await
            .map_err(|_| anyhow::anyhow!("offer timed out waiting for answer"))?
            .ok_or_else(|| anyhow::anyhow!("answer channel closed before an answer arrived"))?;
        self.accept_answer(sdp).await
    }

    pub async fn accept_answer(&self, sdp: serde_json::Value) -> anyhow::Result<()> {
        let sdp_str = sdp
            .get("sdp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("answer missing sdp field"))?;
        let answer = RTCSessionDescription::answer(sdp_str.to_string())?;
        self.peer_connection.set_remote_description(answer).await?;
        *self.state.lock().await = SessionState::Answered;

        let queued = self.pending_ice.lock().await.drain();
        for candidate in queued {
            if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::warn!("failed to apply queued ICE candidate: {e}");
            }
        }
        Ok(())
    }

    /// Queues the candidate if the remote description isn't set yet
    /// (§4.4/§8: capacity 64, drop-oldest-on-overflow), otherwise applies
    /// it immediately.
    pub async fn add_ice_candidate(&self, candidate: serde_json::Value) -> anyhow::Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        if self.peer_connection.remote_description().await.is_none() {
            self.pending_ice.lock().await.push(init);
            return Ok(());
        }
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    pub fn on_ice_candidate(&self, callback: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    if let Ok(json) = c.to_json() {
                        callback(serde_json::json!({
                            "candidate": json.candidate,
                            "sdpMid": json.sdp_mid,
                            "sdpMLineIndex": json.sdp_mline_index,
                        }));
                    }
                }
                Box::pin(async {})
            }));
    }

    /// Applies an updated region (§4.4's `OnGeometryChange`): a
    /// same-dimensions move just retargets the existing `Cropper`; a
    /// dimension change replaces the track on the existing `RTCRtpSender`
    /// via `replace_track`, never tearing down the `RTCPeerConnection`. A
    /// `None` region (viewer unbound) closes the `Cropper` without
    /// touching the peer connection.
    pub async fn apply_region(
        &self,
        feed: FrameFeed,
        region: Option<Rectangle>,
        frame_rate_cap: u32,
    ) -> anyhow::Result<()> {
        let mut cropper_slot = self.cropper.lock().await;

        let Some(region) = region else {
            if let Some(old) = cropper_slot.take() {
                old.close().await;
            }
            return Ok(());
        };

        if let Some(existing) = cropper_slot.as_ref() {
            if existing.dims() == (region.width, region.height) {
                existing.retarget(region);
                return Ok(());
            }
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: VP8_MIME_TYPE.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "wall".to_string(),
            "wall".to_string(),
        ));

        self.sender
            .replace_track(Some(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>))
            .await?;

        let new_cropper = Cropper::bind(feed, region, track, frame_rate_cap)?;
        if let Some(old) = cropper_slot.replace(new_cropper) {
            old.close().await;
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(cropper) = self.cropper.lock().await.take() {
            cropper.close().await;
        }
        if let Err(e) = self.peer_connection.close().await {
            tracing::debug!("error closing peer connection: {e}");
        }
        *self.state.lock().await = SessionState::Closed;
    }

    pub fn pending_ice_capacity(&self) -> usize {
        self.pending_ice_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_ice_drops_oldest_past_capacity() {
        let mut pending = PendingIce::new(2);
        for i in 0..3 {
            pending.push(RTCIceCandidateInit {
                candidate: format!("candidate-{i}"),
                ..Default::default()
            });
        }
        assert_eq!(pending.len(), 2);
        let drained = pending.drain();
        assert_eq!(drained[0].candidate, "candidate-1");
        assert_eq!(drained[1].candidate, "candidate-2");
    }
}
