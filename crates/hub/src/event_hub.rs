//! Event Hub (§4.3): typed bidirectional messaging between the hub and
//! every connected participant, with bounded per-participant outboxes and
//! coalesced region-change notifications.
//!
//! Structured like `handle_browser_ws`/`handle_agent_ws`: each connection
//! runs its own task with a `tokio::select!` loop over inbound WebSocket
//! frames, an outbound queue fed by the registry's fan-out, and a
//! ping/pong keepalive. Backpressure is handled the same way `SignalingChannel`
//! consumers handle a lagging `broadcast` receiver, except here overflow
//! closes the transport instead of dropping frames, per §5.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Duration;

use wall_protocol::{Rectangle, ServerMessage};

use crate::registry::{Registry, RegistryEvent};

/// Which role a connected transport plays. Determines which fan-out
/// events it receives (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Admin,
    Viewer { client_id: String },
    Broadcaster,
}

struct Participant {
    role: Role,
    outbox: mpsc::Sender<ServerMessage>,
}

/// Registry of connected participants' outboxes, keyed by transportId.
/// Shared between the Signal Router (directed forwarding) and the
/// registry-event fan-out loop (broadcast-style notifications).
#[derive(Clone)]
pub struct EventHub {
    participants: Arc<Mutex<HashMap<String, Participant>>>,
    backlog: usize,
}

impl EventHub {
    pub fn new(backlog: usize) -> Self {
        Self {
            participants: Arc::new(Mutex::new(HashMap::new())),
            backlog,
        }
    }

    /// Registers a new participant and returns the receiving half of its
    /// outbound queue, which the connection task forwards onto the socket.
    pub async fn register(&self, transport_id: String, role: Role) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.backlog);
        self.participants
            .lock()
            .await
            .insert(transport_id, Participant { role, outbox: tx });
        rx
    }

    pub async fn unregister(&self, transport_id: &str) {
        self.participants.lock().await.remove(transport_id);
    }

    /// Directed send to a single transport (Signal Router's use case).
    /// Drops the message with a warning if the transport is unknown;
    /// closes the transport if its outbox is full (backpressure by
    /// disconnection, §5) by dropping its sender — the connection task's
    /// `rx.recv()` then returns `None` and the socket is closed.
    pub async fn send_to(&self, transport_id: &str, msg: ServerMessage) -> bool {
        let mut participants = self.participants.lock().await;
        let Some(participant) = participants.get(transport_id) else {
            tracing::warn!(%transport_id, "dropping message: no such transport");
            return false;
        };
        match participant.outbox.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%transport_id, "outbox full, closing transport");
                participants.remove(transport_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                participants.remove(transport_id);
                false
            }
        }
    }

    async fn broadcast_to<F>(&self, msg_for: F)
    where
        F: Fn(&Role) -> Option<ServerMessage>,
    {
        let mut participants = self.participants.lock().await;
        let mut dead = Vec::new();
        for (transport_id, participant) in participants.iter() {
            let Some(msg) = msg_for(&participant.role) else {
                continue;
            };
            match participant.outbox.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%transport_id, "outbox full during broadcast, closing transport");
                    dead.push(transport_id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(transport_id.clone()),
            }
        }
        for transport_id in dead {
            participants.remove(&transport_id);
        }
    }

    pub async fn transport_id_for_broadcaster(&self) -> Option<String> {
        let participants = self.participants.lock().await;
        participants
            .iter()
            .find(|(_, p)| p.role == Role::Broadcaster)
            .map(|(id, _)| id.clone())
    }

    pub async fn transport_id_for_viewer(&self, client_id: &str) -> Option<String> {
        let participants = self.participants.lock().await;
        participants
            .iter()
            .find(|(_, p)| matches!(&p.role, Role::Viewer { client_id: c } if c == client_id))
            .map(|(id, _)| id.clone())
    }
}

/// Drains `registry`'s event stream and translates each `RegistryEvent`
/// into the `ServerMessage`s each role needs (§4.3's per-role topic list),
/// coalescing region-change notifications to the broadcaster.
pub async fn run_fanout(registry: Registry, hub: EventHub, region_coalesce: Duration) {
    let mut events = registry.subscribe();
    let coalescer = RegionCoalescer::new(hub.clone(), registry.clone(), region_coalesce);

    loop {
        let event = match events.recv().await {
            Ok(e) => e,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event hub fan-out lagged behind the registry");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        match event {
            RegistryEvent::RosterChanged(roster) => {
                hub.broadcast_to(|role| match role {
                    Role::Admin => Some(ServerMessage::ClientsUpdate {
                        clients: roster.clone(),
                    }),
                    _ => None,
                })
                .await;
            }
            RegistryEvent::ViewerUpserted(record) => {
                let client_id = record.client_id.clone();
                let wants_session = record.wants_session();
                let region = record.region;
                let viewer_transport_id = record.transport_id.clone();
                let match_client_id = client_id.clone();
                hub.broadcast_to(move |role| match role {
                    Role::Viewer { client_id: c } if *c == match_client_id => Some(ServerMessage::ClientConfig {
                        record: record.clone(),
                    }),
                    _ => None,
                })
                .await;
                // §3/Invariant 3: a Viewer Session exists only once the
                // viewer is connected AND has a region assigned.
                if wants_session {
                    if let (Some(broadcaster_transport), Some(viewer_transport_id)) = (
                        hub.transport_id_for_broadcaster().await,
                        viewer_transport_id,
                    ) {
                        hub.send_to(
                            &broadcaster_transport,
                            ServerMessage::NewViewer {
                                viewer_transport_id,
                                client_id,
                                region,
                            },
                        )
                        .await;
                    }
                }
            }
            RegistryEvent::ViewerRegionChanged {
                client_id,
                region,
                session_should_start,
            } => {
                // A region-less connected viewer just became session-worthy;
                // the broadcaster needs a `new-viewer` now, not a debounced
                // `client-region-updated` for a session it doesn't have yet.
                if session_should_start {
                    if let (Some(broadcaster_transport), Some(viewer_transport_id)) = (
                        hub.transport_id_for_broadcaster().await,
                        hub.transport_id_for_viewer(&client_id).await,
                    ) {
                        hub.send_to(
                            &broadcaster_transport,
                            ServerMessage::NewViewer {
                                viewer_transport_id,
                                client_id: client_id.clone(),
                                region,
                            },
                        )
                        .await;
                    }
                }
                coalescer.notify(client_id, region).await;
            }
            RegistryEvent::ViewerDisconnected {
                client_id: _,
                transport_id,
            } => {
                if let Some(broadcaster_transport) = hub.transport_id_for_broadcaster().await {
                    hub.send_to(
                        &broadcaster_transport,
                        ServerMessage::ViewerDisconnected {
                            viewer_transport_id: transport_id,
                        },
                    )
                    .await;
                }
            }
            RegistryEvent::BroadcasterRegistered {
                transport_id,
                geometry,
                replaced_transport_id,
            } => {
                hub.broadcast_to(move |role| match role {
                    Role::Viewer { .. } => Some(ServerMessage::StreamDimensionsUpdate {
                        width: geometry.width,
                        height: geometry.height,
                    }),
                    _ => None,
                })
                .await;
                if let Some(old) = replaced_transport_id {
                    // The old broadcaster's own transport is about to be
                    // unregistered; telling it is pointless. Every viewer,
                    // on the other hand, needs to know presence changed.
                    hub.broadcast_to(|role| match role {
                        Role::Viewer { .. } => Some(ServerMessage::BroadcasterDisconnected {}),
                        _ => None,
                    })
                    .await;
                    hub.unregister(&old).await;
                }
                // Replay existing session-worthy viewers to the new
                // broadcaster (§8 broadcaster swap): it only ever sees
                // deltas otherwise, never the state that predates it.
                for record in registry.snapshot_roster().await {
                    if !record.wants_session() {
                        continue;
                    }
                    if let Some(viewer_transport_id) = record.transport_id.clone() {
                        hub.send_to(
                            &transport_id,
                            ServerMessage::NewViewer {
                                viewer_transport_id,
                                client_id: record.client_id.clone(),
                                region: record.region,
                            },
                        )
                        .await;
                    }
                }
            }
            RegistryEvent::BroadcasterCleared => {
                hub.broadcast_to(|role| match role {
                    Role::Viewer { .. } => Some(ServerMessage::BroadcasterDisconnected {}),
                    _ => None,
                })
                .await;
            }
        }
    }
}

/// Debounces region-change notifications per clientId to at most one
/// every `window` (§4.3, default 50ms). Each clientId gets its own
/// lazily-spawned flush task; new updates reset that task's wait via a
/// `watch` channel rather than spawning a fresh task per update.
#[derive(Clone)]
struct RegionCoalescer {
    hub: EventHub,
    registry: Registry,
    window: Duration,
    active: Arc<Mutex<HashMap<String, watch::Sender<Option<Rectangle>>>>>,
}

impl RegionCoalescer {
    fn new(hub: EventHub, registry: Registry, window: Duration) -> Self {
        Self {
            hub,
            registry,
            window,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn notify(&self, client_id: String, region: Option<Rectangle>) {
        let mut active = self.active.lock().await;
        if let Some(tx) = active.get(&client_id) {
            let _ = tx.send(region);
            return;
        }

        let (tx, rx) = watch::channel(region);
        active.insert(client_id.clone(), tx);
        drop(active);

        let hub = self.hub.clone();
        let registry = self.registry.clone();
        let window = self.window;
        let active = self.active.clone();
        tokio::spawn(async move {
            flush_loop(client_id, rx, window, hub, registry, active).await;
        });
    }
}

/// Flushes the coalesced region to both sides (§4.3): the broadcaster gets
/// `client-region-updated` to retarget/replace the viewer's Cropper track,
/// and the viewer itself gets `region-update` so its own UI reflects the
/// change (spec.md:100 — this must reach the viewer, not just the
/// broadcaster).
async fn flush_loop(
    client_id: String,
    mut rx: watch::Receiver<Option<Rectangle>>,
    window: Duration,
    hub: EventHub,
    registry: Registry,
    active: Arc<Mutex<HashMap<String, watch::Sender<Option<Rectangle>>>>>,
) {
    loop {
        match tokio::time::timeout(window, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return,
            Err(_elapsed) => break,
        }
    }

    active.lock().await.remove(&client_id);
    let region = *rx.borrow();

    if let Some(transport_id) = hub.transport_id_for_broadcaster().await {
        hub.send_to(
            &transport_id,
            ServerMessage::ClientRegionUpdated {
                client_id: client_id.clone(),
                region,
            },
        )
        .await;
    }

    if let Some(viewer_transport_id) = hub.transport_id_for_viewer(&client_id).await {
        let geometry = registry.broadcaster_geometry().await;
        hub.send_to(
            &viewer_transport_id,
            ServerMessage::RegionUpdate {
                client_id,
                region,
                geometry,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn coalescer_collapses_rapid_updates_into_one_flush() {
        let hub = EventHub::new(16);
        let mut broadcaster_rx = hub.register("bt".into(), Role::Broadcaster).await;
        let mut viewer_rx = hub
            .register("vt".into(), Role::Viewer { client_id: "wall-a".into() })
            .await;
        let registry = Registry::spawn();
        let coalescer = RegionCoalescer::new(hub.clone(), registry.clone(), Duration::from_millis(50));

        for i in 0..10u32 {
            coalescer
                .notify("wall-a".into(), Some(Rectangle::new(i, 0, 10, 10).unwrap()))
                .await;
            tokio::time::advance(Duration::from_millis(5)).await;
        }

        // No flush yet: updates kept resetting the debounce window.
        assert!(broadcaster_rx.try_recv().is_err());
        assert!(viewer_rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(60)).await;
        let msg = broadcaster_rx.recv().await.unwrap();
        match msg {
            ServerMessage::ClientRegionUpdated { client_id, region } => {
                assert_eq!(client_id, "wall-a");
                assert_eq!(region.unwrap().x, 9);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // The viewer itself must also learn about its own region change.
        let viewer_msg = viewer_rx.recv().await.unwrap();
        match viewer_msg {
            ServerMessage::RegionUpdate { client_id, region, .. } => {
                assert_eq!(client_id, "wall-a");
                assert_eq!(region.unwrap().x, 9);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_unknown_transport_returns_false() {
        let hub = EventHub::new(4);
        let delivered = hub
            .send_to("ghost", ServerMessage::BroadcasterDisconnected {})
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn full_outbox_closes_transport() {
        let hub = EventHub::new(1);
        let mut rx = hub.register("t1".into(), Role::Admin).await;

        assert!(
            hub.send_to("t1", ServerMessage::BroadcasterDisconnected {})
                .await
        );
        // Second send overflows the depth-1 queue and closes the transport.
        assert!(
            !hub
                .send_to("t1", ServerMessage::BroadcasterDisconnected {})
                .await
        );

        let _ = rx.recv().await; // drains the one message that made it through
        assert!(rx.recv().await.is_none(), "transport should be closed");
    }

    #[tokio::test]
    async fn viewer_upserted_without_region_does_not_create_session() {
        let registry = Registry::spawn();
        let hub = EventHub::new(16);
        tokio::spawn(run_fanout(registry.clone(), hub.clone(), Duration::from_millis(10)));

        let mut broadcaster_rx = hub.register("bt".into(), Role::Broadcaster).await;
        registry
            .register_broadcaster("bt", wall_protocol::StreamGeometry::new(1920, 1080).unwrap())
            .await;

        registry.upsert_viewer("wall-a", "vt", None).await;

        let result = tokio::time::timeout(Duration::from_millis(150), broadcaster_rx.recv()).await;
        assert!(
            result.is_err(),
            "no new-viewer should be sent for a region-less viewer"
        );
    }

    #[tokio::test]
    async fn region_set_on_connected_regionless_viewer_creates_session() {
        let registry = Registry::spawn();
        let hub = EventHub::new(16);
        tokio::spawn(run_fanout(registry.clone(), hub.clone(), Duration::from_millis(10)));

        let mut broadcaster_rx = hub.register("bt".into(), Role::Broadcaster).await;
        registry
            .register_broadcaster("bt", wall_protocol::StreamGeometry::new(1920, 1080).unwrap())
            .await;

        let mut _viewer_rx = hub
            .register("vt".into(), Role::Viewer { client_id: "wall-a".into() })
            .await;
        registry.upsert_viewer("wall-a", "vt", None).await;

        let rect = Rectangle::new(0, 0, 640, 360).unwrap();
        registry.set_region("wall-a", Some(rect)).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_millis(300), broadcaster_rx.recv())
            .await
            .expect("expected a new-viewer within the timeout")
            .unwrap();
        match msg {
            ServerMessage::NewViewer {
                viewer_transport_id,
                client_id,
                region,
            } => {
                assert_eq!(viewer_transport_id, "vt");
                assert_eq!(client_id, "wall-a");
                assert_eq!(region, Some(rect));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcaster_swap_replays_sessions_and_notifies_viewers() {
        let registry = Registry::spawn();
        let hub = EventHub::new(16);
        tokio::spawn(run_fanout(registry.clone(), hub.clone(), Duration::from_millis(10)));

        let geom = wall_protocol::StreamGeometry::new(1920, 1080).unwrap();
        let mut b1_rx = hub.register("b1".into(), Role::Broadcaster).await;
        registry.register_broadcaster("b1", geom).await;

        let mut viewer_rx = hub
            .register("vt".into(), Role::Viewer { client_id: "wall-a".into() })
            .await;
        registry.upsert_viewer("wall-a", "vt", None).await;
        let rect = Rectangle::new(0, 0, 640, 360).unwrap();
        registry.set_region("wall-a", Some(rect)).await.unwrap();

        // Drain the new-viewer that establishes the session on b1.
        let _ = tokio::time::timeout(Duration::from_millis(300), b1_rx.recv())
            .await
            .unwrap();

        hub.unregister("b1").await;
        let mut b2_rx = hub.register("b2".into(), Role::Broadcaster).await;
        registry.register_broadcaster("b2", geom).await;

        let mut saw_disconnect = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_millis(300), viewer_rx.recv()).await {
                Ok(Some(ServerMessage::BroadcasterDisconnected {})) => {
                    saw_disconnect = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_disconnect, "viewer should be told the broadcaster changed");

        let mut saw_new_viewer = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_millis(300), b2_rx.recv()).await {
                Ok(Some(ServerMessage::NewViewer { client_id, region, .. })) => {
                    assert_eq!(client_id, "wall-a");
                    assert_eq!(region, Some(rect));
                    saw_new_viewer = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(
            saw_new_viewer,
            "the new broadcaster should learn about the existing viewer session"
        );
    }
}
