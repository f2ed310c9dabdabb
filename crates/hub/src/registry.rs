//! Session Registry (§4.1): the authoritative in-memory store of
//! broadcaster presence, viewer roster, and region assignments.
//!
//! `RegistryState` is pure and unit-testable in isolation — no tokio, no
//! channels — the same split `SessionManager`/`DisplayPool` draw between
//! pool bookkeeping and its `RwLock` wrapper. `Registry` is the thin actor
//! shell around it: a single-owner task draining an `mpsc` command queue,
//! which is what lets every mutation pair with exactly one fan-out event
//! (Invariant 6) without a race between "mutate" and "notify".

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Duration;

use wall_protocol::{BroadcasterRecord, Rectangle, StreamGeometry, ViewerRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown viewer clientId")]
    UnknownViewer,
}

/// What a transportId currently refers to, for reverse lookups on
/// disconnection (§4.1 `lookupByTransport`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportBinding {
    Viewer(String),
    Broadcaster,
}

/// Events the registry emits after a successful mutation. The Event Hub
/// fans these out to the roles that care (§4.3).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Sent to admins on every roster mutation.
    RosterChanged(Vec<ViewerRecord>),
    /// A broadcaster registered, possibly replacing a prior one.
    BroadcasterRegistered {
        transport_id: String,
        geometry: StreamGeometry,
        replaced_transport_id: Option<String>,
    },
    /// The broadcaster's transport was marked disconnected.
    BroadcasterCleared,
    /// A viewer (re)connected or was first created; sent to the
    /// broadcaster as a `new-viewer` candidate and to the viewer itself
    /// as its own `client-config`.
    ViewerUpserted(ViewerRecord),
    /// A viewer's region changed; the broadcaster needs this to bind or
    /// retarget a Viewer Session, the viewer needs it for `region-update`.
    /// `session_should_start` is set when this transition is what makes the
    /// viewer want a session for the first time (it was already connected
    /// but had no region) — the Event Hub fires `new-viewer` immediately
    /// rather than waiting for the debounced region notification.
    ViewerRegionChanged {
        client_id: String,
        region: Option<Rectangle>,
        session_should_start: bool,
    },
    /// A viewer's transport was marked disconnected.
    ViewerDisconnected {
        client_id: String,
        transport_id: String,
    },
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Pure registry state. No I/O, no async — every method is a synchronous,
/// total function over the current state.
#[derive(Debug, Default)]
pub struct RegistryState {
    viewers: BTreeMap<String, ViewerRecord>,
    broadcaster: Option<BroadcasterRecord>,
    /// Reverse index: transportId -> what it is, for §4.1 `lookupByTransport`.
    transports: HashMap<String, TransportBinding>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_viewer(
        &mut self,
        client_id: &str,
        transport_id: &str,
        display_name: Option<String>,
    ) -> ViewerRecord {
        let now = now_ms();
        let record = self
            .viewers
            .entry(client_id.to_string())
            .or_insert_with(|| ViewerRecord {
                client_id: client_id.to_string(),
                transport_id: None,
                display_name: None,
                connected: false,
                region: None,
                last_seen_at: now,
            });

        if let Some(old_transport) = record.transport_id.replace(transport_id.to_string()) {
            self.transports.remove(&old_transport);
        }
        record.connected = true;
        if display_name.is_some() {
            record.display_name = display_name;
        }
        record.last_seen_at = record.last_seen_at.max(now);

        self.transports
            .insert(transport_id.to_string(), TransportBinding::Viewer(client_id.to_string()));

        record.clone()
    }

    pub fn mark_disconnected(&mut self, transport_id: &str) -> Option<TransportBinding> {
        let binding = self.transports.remove(transport_id)?;
        match &binding {
            TransportBinding::Viewer(client_id) => {
                if let Some(record) = self.viewers.get_mut(client_id) {
                    record.connected = false;
                    record.transport_id = None;
                    record.last_seen_at = record.last_seen_at.max(now_ms());
                }
            }
            TransportBinding::Broadcaster => {
                if let Some(b) = &self.broadcaster {
                    if b.transport_id == transport_id {
                        self.broadcaster = None;
                    }
                }
            }
        }
        Some(binding)
    }

    /// Normalizes (rounds, clips to current geometry) before storing, per
    /// §4.1. `region = None` clears the assignment.
    pub fn set_region(
        &mut self,
        client_id: &str,
        region: Option<Rectangle>,
    ) -> Result<ViewerRecord, RegistryError> {
        let geometry = self.broadcaster.as_ref().map(|b| b.geometry);
        let record = self
            .viewers
            .get_mut(client_id)
            .ok_or(RegistryError::UnknownViewer)?;

        let normalized = match (region, geometry) {
            (Some(r), Some(geom)) if !r.fits(geom) => {
                Rectangle::clipped(r.x as f64, r.y as f64, r.width as f64, r.height as f64, Some(geom)).ok()
            }
            (other, _) => other,
        };

        record.region = normalized;
        record.last_seen_at = record.last_seen_at.max(now_ms());
        Ok(record.clone())
    }

    /// Admin-driven rename; unlike `upsert_viewer` this never creates a
    /// record or touches connection state.
    pub fn set_display_name(
        &mut self,
        client_id: &str,
        display_name: String,
    ) -> Result<ViewerRecord, RegistryError> {
        let record = self
            .viewers
            .get_mut(client_id)
            .ok_or(RegistryError::UnknownViewer)?;
        record.display_name = Some(display_name);
        record.last_seen_at = record.last_seen_at.max(now_ms());
        Ok(record.clone())
    }

    /// Replaces any prior broadcaster slot and returns the previous
    /// occupant's transportId so the caller can close that transport
    /// (§4.1, Invariant 1 / §8 "at-most-one broadcaster").
    pub fn register_broadcaster(&mut self, transport_id: &str, geometry: StreamGeometry) -> Option<String> {
        let previous = self.broadcaster.take();
        if let Some(prev) = &previous {
            self.transports.remove(&prev.transport_id);
        }
        self.broadcaster = Some(BroadcasterRecord {
            transport_id: transport_id.to_string(),
            geometry,
        });
        self.transports
            .insert(transport_id.to_string(), TransportBinding::Broadcaster);
        previous.map(|p| p.transport_id)
    }

    /// Ordered by clientId ascending — stable for tests and for the
    /// admin-facing roster snapshot (§4.1).
    pub fn snapshot_roster(&self) -> Vec<ViewerRecord> {
        self.viewers.values().cloned().collect()
    }

    pub fn broadcaster(&self) -> Option<&BroadcasterRecord> {
        self.broadcaster.as_ref()
    }

    pub fn viewer(&self, client_id: &str) -> Option<&ViewerRecord> {
        self.viewers.get(client_id)
    }

    pub fn lookup_by_transport(&self, transport_id: &str) -> Option<TransportBinding> {
        self.transports.get(transport_id).cloned()
    }

    /// Discards disconnected `ViewerRecord`s whose `last_seen_at` is older
    /// than `ttl` (§5, default 1800s). Their region is discarded with them.
    /// Returns the clientIds removed.
    pub fn gc_stale(&mut self, ttl: Duration) -> Vec<String> {
        let cutoff = now_ms().saturating_sub(ttl.as_millis() as u64);
        let stale: Vec<String> = self
            .viewers
            .iter()
            .filter(|(_, v)| !v.connected && v.last_seen_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.viewers.remove(id);
        }
        stale
    }
}

enum Command {
    UpsertViewer {
        client_id: String,
        transport_id: String,
        display_name: Option<String>,
        reply: oneshot::Sender<ViewerRecord>,
    },
    MarkDisconnected {
        transport_id: String,
        reply: oneshot::Sender<Option<TransportBinding>>,
    },
    SetRegion {
        client_id: String,
        region: Option<Rectangle>,
        reply: oneshot::Sender<Result<ViewerRecord, RegistryError>>,
    },
    SetDisplayName {
        client_id: String,
        display_name: String,
        reply: oneshot::Sender<Result<ViewerRecord, RegistryError>>,
    },
    ViewerRecord {
        client_id: String,
        reply: oneshot::Sender<Option<ViewerRecord>>,
    },
    RegisterBroadcaster {
        transport_id: String,
        geometry: StreamGeometry,
        reply: oneshot::Sender<Option<String>>,
    },
    SnapshotRoster {
        reply: oneshot::Sender<Vec<ViewerRecord>>,
    },
    LookupByTransport {
        transport_id: String,
        reply: oneshot::Sender<Option<TransportBinding>>,
    },
    BroadcasterGeometry {
        reply: oneshot::Sender<Option<StreamGeometry>>,
    },
    GcStale {
        ttl: Duration,
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to the registry actor. Cheap to clone; every clone shares the
/// same single-owner task.
#[derive(Clone)]
pub struct Registry {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Spawns the actor task and returns a handle to it.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);
        let handle = Self {
            commands: tx,
            events: events.clone(),
        };
        tokio::spawn(run(rx, events));
        handle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn upsert_viewer(
        &self,
        client_id: impl Into<String>,
        transport_id: impl Into<String>,
        display_name: Option<String>,
    ) -> ViewerRecord {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::UpsertViewer {
                client_id: client_id.into(),
                transport_id: transport_id.into(),
                display_name,
                reply,
            })
            .await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn mark_disconnected(&self, transport_id: impl Into<String>) -> Option<TransportBinding> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::MarkDisconnected {
                transport_id: transport_id.into(),
                reply,
            })
            .await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn set_region(
        &self,
        client_id: impl Into<String>,
        region: Option<Rectangle>,
    ) -> Result<ViewerRecord, RegistryError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::SetRegion {
                client_id: client_id.into(),
                region,
                reply,
            })
            .await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn set_display_name(
        &self,
        client_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<ViewerRecord, RegistryError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::SetDisplayName {
                client_id: client_id.into(),
                display_name: display_name.into(),
                reply,
            })
            .await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn viewer_record(&self, client_id: impl Into<String>) -> Option<ViewerRecord> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::ViewerRecord {
                client_id: client_id.into(),
                reply,
            })
            .await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn register_broadcaster(
        &self,
        transport_id: impl Into<String>,
        geometry: StreamGeometry,
    ) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::RegisterBroadcaster {
                transport_id: transport_id.into(),
                geometry,
                reply,
            })
            .await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn snapshot_roster(&self) -> Vec<ViewerRecord> {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::SnapshotRoster { reply }).await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn lookup_by_transport(&self, transport_id: impl Into<String>) -> Option<TransportBinding> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::LookupByTransport {
                transport_id: transport_id.into(),
                reply,
            })
            .await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn broadcaster_geometry(&self) -> Option<StreamGeometry> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::BroadcasterGeometry { reply })
            .await;
        rx.await.expect("registry actor dropped reply")
    }

    pub async fn gc_stale(&self, ttl: Duration) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::GcStale { ttl, reply }).await;
        rx.await.expect("registry actor dropped reply")
    }
}

async fn run(mut rx: mpsc::Receiver<Command>, events: broadcast::Sender<RegistryEvent>) {
    let mut state = RegistryState::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::UpsertViewer {
                client_id,
                transport_id,
                display_name,
                reply,
            } => {
                let record = state.upsert_viewer(&client_id, &transport_id, display_name);
                let _ = events.send(RegistryEvent::ViewerUpserted(record.clone()));
                let _ = events.send(RegistryEvent::RosterChanged(state.snapshot_roster()));
                let _ = reply.send(record);
            }
            Command::MarkDisconnected { transport_id, reply } => {
                let binding = state.mark_disconnected(&transport_id);
                match &binding {
                    Some(TransportBinding::Viewer(client_id)) => {
                        let _ = events.send(RegistryEvent::ViewerDisconnected {
                            client_id: client_id.clone(),
                            transport_id: transport_id.clone(),
                        });
                        let _ = events.send(RegistryEvent::RosterChanged(state.snapshot_roster()));
                    }
                    Some(TransportBinding::Broadcaster) => {
                        let _ = events.send(RegistryEvent::BroadcasterCleared);
                    }
                    None => {}
                }
                let _ = reply.send(binding);
            }
            Command::SetRegion {
                client_id,
                region,
                reply,
            } => {
                let existing = state.viewer(&client_id);
                let before = existing.and_then(|v| v.region);
                let was_connected = existing.map(|v| v.connected).unwrap_or(false);
                let result = state.set_region(&client_id, region);
                if let Ok(record) = &result {
                    // §8: setting region to its current (post-normalization)
                    // value is a no-op and must not trigger a roster-change.
                    if record.region != before {
                        // A connected viewer that had no region didn't want
                        // a session before; it does now.
                        let session_should_start =
                            was_connected && before.is_none() && record.region.is_some();
                        let _ = events.send(RegistryEvent::ViewerRegionChanged {
                            client_id: client_id.clone(),
                            region: record.region,
                            session_should_start,
                        });
                        let _ = events.send(RegistryEvent::RosterChanged(state.snapshot_roster()));
                    }
                }
                let _ = reply.send(result);
            }
            Command::SetDisplayName {
                client_id,
                display_name,
                reply,
            } => {
                let result = state.set_display_name(&client_id, display_name);
                if let Ok(record) = &result {
                    let _ = events.send(RegistryEvent::ViewerUpserted(record.clone()));
                    let _ = events.send(RegistryEvent::RosterChanged(state.snapshot_roster()));
                }
                let _ = reply.send(result);
            }
            Command::ViewerRecord { client_id, reply } => {
                let _ = reply.send(state.viewer(&client_id).cloned());
            }
            Command::RegisterBroadcaster {
                transport_id,
                geometry,
                reply,
            } => {
                let replaced = state.register_broadcaster(&transport_id, geometry);
                let _ = events.send(RegistryEvent::BroadcasterRegistered {
                    transport_id: transport_id.clone(),
                    geometry,
                    replaced_transport_id: replaced.clone(),
                });
                let _ = reply.send(replaced);
            }
            Command::SnapshotRoster { reply } => {
                let _ = reply.send(state.snapshot_roster());
            }
            Command::LookupByTransport { transport_id, reply } => {
                let _ = reply.send(state.lookup_by_transport(&transport_id));
            }
            Command::BroadcasterGeometry { reply } => {
                let _ = reply.send(state.broadcaster().map(|b| b.geometry));
            }
            Command::GcStale { ttl, reply } => {
                let removed = state.gc_stale(ttl);
                if !removed.is_empty() {
                    let _ = events.send(RegistryEvent::RosterChanged(state.snapshot_roster()));
                }
                let _ = reply.send(removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_then_revives_across_reconnect() {
        let mut state = RegistryState::new();
        let first = state.upsert_viewer("wall-a", "t1", Some("Lobby A".into()));
        assert!(first.connected);
        assert_eq!(first.transport_id.as_deref(), Some("t1"));

        state.mark_disconnected("t1");
        assert!(!state.viewer("wall-a").unwrap().connected);

        let revived = state.upsert_viewer("wall-a", "t2", None);
        assert!(revived.connected);
        assert_eq!(revived.transport_id.as_deref(), Some("t2"));
        // display_name from the first registration is preserved.
        assert_eq!(revived.display_name.as_deref(), Some("Lobby A"));
    }

    #[test]
    fn set_region_rejects_unknown_viewer() {
        let mut state = RegistryState::new();
        let err = state
            .set_region("ghost", Some(Rectangle::new(0, 0, 10, 10).unwrap()))
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownViewer);
    }

    #[test]
    fn set_region_clips_to_current_geometry() {
        let mut state = RegistryState::new();
        state.upsert_viewer("wall-a", "t1", None);
        state.register_broadcaster("bt", StreamGeometry::new(1920, 1080).unwrap());

        let record = state
            .set_region("wall-a", Some(Rectangle::new(1900, 1000, 200, 200).unwrap()))
            .unwrap();
        let region = record.region.unwrap();
        assert_eq!(region.width, 20);
        assert_eq!(region.height, 80);
    }

    #[test]
    fn register_broadcaster_replaces_prior_and_returns_it() {
        let mut state = RegistryState::new();
        let geom = StreamGeometry::new(1920, 1080).unwrap();
        assert_eq!(state.register_broadcaster("b1", geom), None);
        let replaced = state.register_broadcaster("b2", geom);
        assert_eq!(replaced.as_deref(), Some("b1"));
        assert_eq!(state.broadcaster().unwrap().transport_id, "b2");
        // The old transport no longer resolves.
        assert_eq!(state.lookup_by_transport("b1"), None);
    }

    #[test]
    fn viewer_reconnect_preserves_region() {
        let mut state = RegistryState::new();
        state.upsert_viewer("wall-a", "t1", None);
        let rect = Rectangle::new(0, 0, 640, 360).unwrap();
        state.set_region("wall-a", Some(rect)).unwrap();

        state.mark_disconnected("t1");
        state.upsert_viewer("wall-a", "t2", None);

        assert_eq!(state.viewer("wall-a").unwrap().region, Some(rect));
    }

    #[test]
    fn snapshot_roster_is_ordered_by_client_id() {
        let mut state = RegistryState::new();
        state.upsert_viewer("wall-c", "t3", None);
        state.upsert_viewer("wall-a", "t1", None);
        state.upsert_viewer("wall-b", "t2", None);

        let ids: Vec<_> = state
            .snapshot_roster()
            .into_iter()
            .map(|v| v.client_id)
            .collect();
        assert_eq!(ids, vec!["wall-a", "wall-b", "wall-c"]);
    }

    #[test]
    fn gc_stale_discards_disconnected_past_ttl_and_keeps_connected() {
        let mut state = RegistryState::new();
        state.upsert_viewer("wall-a", "t1", None);
        state.upsert_viewer("wall-b", "t2", None);
        state.mark_disconnected("t1");
        // wall-b stays connected; wall-a's last_seen_at is "now", so a
        // zero-duration TTL makes it immediately eligible.
        let removed = state.gc_stale(Duration::from_millis(0));
        assert_eq!(removed, vec!["wall-a".to_string()]);
        assert!(state.viewer("wall-a").is_none());
        assert!(state.viewer("wall-b").is_some());
    }

    #[test]
    fn set_display_name_rejects_unknown_viewer() {
        let mut state = RegistryState::new();
        assert_eq!(
            state.set_display_name("ghost", "x".into()).unwrap_err(),
            RegistryError::UnknownViewer
        );
    }

    #[test]
    fn set_display_name_renames_without_touching_connection_state() {
        let mut state = RegistryState::new();
        state.upsert_viewer("wall-a", "t1", None);
        state.mark_disconnected("t1");
        let record = state.set_display_name("wall-a", "Lobby A".into()).unwrap();
        assert_eq!(record.display_name.as_deref(), Some("Lobby A"));
        assert!(!record.connected);
    }

    #[tokio::test]
    async fn actor_upsert_and_snapshot_roundtrip() {
        let registry = Registry::spawn();
        registry.upsert_viewer("wall-a", "t1", None).await;
        let roster = registry.snapshot_roster().await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].client_id, "wall-a");
    }

    #[tokio::test]
    async fn actor_broadcaster_swap_emits_event_with_replaced_transport() {
        let registry = Registry::spawn();
        let mut events = registry.subscribe();
        let geom = StreamGeometry::new(1920, 1080).unwrap();

        registry.register_broadcaster("b1", geom).await;
        let _ = events.recv().await.unwrap();

        let replaced = registry.register_broadcaster("b2", geom).await;
        assert_eq!(replaced.as_deref(), Some("b1"));
        match events.recv().await.unwrap() {
            RegistryEvent::BroadcasterRegistered {
                replaced_transport_id,
                ..
            } => assert_eq!(replaced_transport_id.as_deref(), Some("b1")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn actor_same_value_region_set_does_not_emit_region_changed() {
        let registry = Registry::spawn();
        let mut events = registry.subscribe();
        registry.upsert_viewer("wall-a", "t1", None).await;
        let _ = events.recv().await.unwrap(); // ViewerUpserted
        let _ = events.recv().await.unwrap(); // RosterChanged

        let rect = Rectangle::new(0, 0, 640, 360).unwrap();
        registry.set_region("wall-a", Some(rect)).await.unwrap();
        let _ = events.recv().await.unwrap(); // ViewerRegionChanged
        let _ = events.recv().await.unwrap(); // RosterChanged

        registry.set_region("wall-a", Some(rect)).await.unwrap();
        // No further events should be emitted for the no-op set; the next
        // event (if any) must not arrive within a short window.
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), events.recv()).await;
        assert!(result.is_err(), "no-op region set must not emit an event");
    }

    #[tokio::test]
    async fn actor_first_region_on_connected_viewer_signals_session_start() {
        let registry = Registry::spawn();
        let mut events = registry.subscribe();
        registry.upsert_viewer("wall-a", "t1", None).await;
        let _ = events.recv().await.unwrap(); // ViewerUpserted
        let _ = events.recv().await.unwrap(); // RosterChanged

        let rect = Rectangle::new(0, 0, 640, 360).unwrap();
        registry.set_region("wall-a", Some(rect)).await.unwrap();
        match events.recv().await.unwrap() {
            RegistryEvent::ViewerRegionChanged {
                session_should_start,
                ..
            } => assert!(session_should_start, "first region on a connected viewer should start a session"),
            other => panic!("unexpected event: {other:?}"),
        }
        let _ = events.recv().await.unwrap(); // RosterChanged

        let moved = Rectangle::new(10, 0, 640, 360).unwrap();
        registry.set_region("wall-a", Some(moved)).await.unwrap();
        match events.recv().await.unwrap() {
            RegistryEvent::ViewerRegionChanged {
                session_should_start,
                ..
            } => assert!(!session_should_start, "moving an already-assigned region must not re-signal session start"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
