//! Ties incoming hub messages to Viewer Session lifecycle (§3): a
//! `ViewerSession` is created when the hub announces a new viewer, bound to
//! a region as soon as one arrives, retargeted/replaced on region changes,
//! and torn down when the viewer disconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use webrtc::ice_transport::ice_server::RTCIceServer;

use wall_protocol::{ClientMessage, ServerMessage};

use crate::source::FrameSource;
use crate::viewer_session::ViewerSession;

struct SessionEntry {
    session: Arc<ViewerSession>,
    client_id: String,
    answer_tx: mpsc::Sender<serde_json::Value>,
}

pub(crate) struct Coordinator {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    client_to_transport: Mutex<HashMap<String, String>>,
    outbox_tx: mpsc::Sender<ClientMessage>,
    source: Arc<dyn FrameSource>,
    ice_servers: Vec<RTCIceServer>,
    pending_ice_capacity: usize,
    offer_timeout: Duration,
    frame_rate_cap: u32,
}

impl Coordinator {
    pub(crate) fn new(
        outbox_tx: mpsc::Sender<ClientMessage>,
        source: Arc<dyn FrameSource>,
        ice_servers: Vec<RTCIceServer>,
        pending_ice_capacity: usize,
        offer_timeout: Duration,
        frame_rate_cap: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            client_to_transport: Mutex::new(HashMap::new()),
            outbox_tx,
            source,
            ice_servers,
            pending_ice_capacity,
            offer_timeout,
            frame_rate_cap,
        })
    }

    pub(crate) async fn handle(self: &Arc<Self>, msg: ServerMessage) {
        match msg {
            ServerMessage::NewViewer {
                viewer_transport_id,
                client_id,
                region,
            } => {
                self.on_new_viewer(viewer_transport_id, client_id, region).await;
            }
            ServerMessage::ClientRegionUpdated { client_id, region } => {
                self.on_region_updated(client_id, region).await;
            }
            ServerMessage::ViewerAnswer {
                viewer_transport_id,
                sdp,
            } => {
                self.on_viewer_answer(viewer_transport_id, sdp).await;
            }
            ServerMessage::ViewerIceCandidate {
                viewer_transport_id,
                candidate,
            } => {
                self.on_viewer_ice_candidate(viewer_transport_id, candidate)
                    .await;
            }
            ServerMessage::ViewerDisconnected { viewer_transport_id } => {
                self.on_viewer_disconnected(viewer_transport_id).await;
            }
            ServerMessage::Error { code, message } => {
                tracing::warn!(%code, %message, "hub reported an error");
            }
            // Dimension/roster bookkeeping the broadcaster doesn't act on.
            ServerMessage::ClientConfig { .. }
            | ServerMessage::RegionUpdate { .. }
            | ServerMessage::ClientsUpdate { .. }
            | ServerMessage::StreamDimensions { .. }
            | ServerMessage::StreamDimensionsUpdate { .. }
            | ServerMessage::BroadcasterOffer { .. }
            | ServerMessage::BroadcasterIceCandidate { .. }
            | ServerMessage::BroadcasterDisconnected {} => {}
        }
    }

    async fn on_new_viewer(
        self: &Arc<Self>,
        viewer_transport_id: String,
        client_id: String,
        region: Option<wall_protocol::Rectangle>,
    ) {
        let session = match ViewerSession::create(
            self.ice_servers.clone(),
            self.pending_ice_capacity,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("failed to create viewer session for {client_id}: {e:#}");
                return;
            }
        };

        // A region may already be assigned (§8 assign-then-connect): bind a
        // real Cropper now rather than leaving the session on the 1x1
        // placeholder until some future region change.
        if region.is_some() {
            let feed = self.source.subscribe();
            if let Err(e) = session.apply_region(feed, region, self.frame_rate_cap).await {
                tracing::error!("failed to apply initial region for {client_id}: {e:#}");
            }
        }

        let outbox_tx = self.outbox_tx.clone();
        let transport_id_for_ice = viewer_transport_id.clone();
        session.on_ice_candidate(move |candidate| {
            let outbox_tx = outbox_tx.clone();
            let viewer_transport_id = transport_id_for_ice.clone();
            tokio::spawn(async move {
                let _ = outbox_tx
                    .send(ClientMessage::BroadcasterIceCandidate {
                        viewer_transport_id,
                        candidate,
                    })
                    .await;
            });
        });

        let (answer_tx, answer_rx) = mpsc::channel(1);
        self.sessions.lock().await.insert(
            viewer_transport_id.clone(),
            SessionEntry {
                session: Arc::clone(&session),
                client_id: client_id.clone(),
                answer_tx,
            },
        );
        self.client_to_transport
            .lock()
            .await
            .insert(client_id.clone(), viewer_transport_id.clone());

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let offer = match session.create_offer().await {
                Ok(sdp) => sdp,
                Err(e) => {
                    tracing::error!("failed to create offer for {viewer_transport_id}: {e:#}");
                    coordinator.drop_session(&viewer_transport_id).await;
                    return;
                }
            };

            let sent = coordinator
                .outbox_tx
                .send(ClientMessage::BroadcasterOffer {
                    viewer_transport_id: viewer_transport_id.clone(),
                    sdp: serde_json::json!({ "type": "offer", "sdp": offer }),
                })
                .await;
            if sent.is_err() {
                return;
            }

            if let Err(e) = session
                .await_answer(answer_rx, coordinator.offer_timeout)
                .await
            {
                tracing::warn!("viewer session {viewer_transport_id} failed to answer: {e:#}");
                coordinator.drop_session(&viewer_transport_id).await;
            }
        });
    }

    async fn on_region_updated(
        &self,
        client_id: String,
        region: Option<wall_protocol::Rectangle>,
    ) {
        let transport_id = match self.client_to_transport.lock().await.get(&client_id).cloned() {
            Some(id) => id,
            None => return,
        };
        let session = match self.sessions.lock().await.get(&transport_id) {
            Some(entry) => Arc::clone(&entry.session),
            None => return,
        };

        let feed = self.source.subscribe();
        if let Err(e) = session.apply_region(feed, region, self.frame_rate_cap).await {
            tracing::error!("failed to apply region for {client_id}: {e:#}");
        }
    }

    async fn on_viewer_answer(&self, viewer_transport_id: String, sdp: serde_json::Value) {
        let answer_tx = self
            .sessions
            .lock()
            .await
            .get(&viewer_transport_id)
            .map(|entry| entry.answer_tx.clone());
        if let Some(answer_tx) = answer_tx {
            let _ = answer_tx.send(sdp).await;
        }
    }

    async fn on_viewer_ice_candidate(&self, viewer_transport_id: String, candidate: serde_json::Value) {
        let session = self
            .sessions
            .lock()
            .await
            .get(&viewer_transport_id)
            .map(|entry| Arc::clone(&entry.session));
        if let Some(session) = session {
            if let Err(e) = session.add_ice_candidate(candidate).await {
                tracing::warn!("failed to apply ICE candidate for {viewer_transport_id}: {e:#}");
            }
        }
    }

    async fn on_viewer_disconnected(&self, viewer_transport_id: String) {
        self.drop_session(&viewer_transport_id).await;
    }

    async fn drop_session(&self, viewer_transport_id: &str) {
        let entry = self.sessions.lock().await.remove(viewer_transport_id);
        if let Some(entry) = entry {
            self.client_to_transport.lock().await.remove(&entry.client_id);
            entry.session.close().await;
        }
    }
}
