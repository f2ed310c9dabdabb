use serde::{Deserialize, Deserializer, Serialize};

use crate::{Rectangle, StreamGeometry, ViewerRecord};

/// Messages sent by a participant (admin, viewer, or broadcaster) to the hub (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Broadcaster announces it is live and publishes its source dimensions.
    RegisterBroadcaster { geometry: StreamGeometry },
    /// Viewer announces itself by its stable clientId.
    RegisterViewer {
        client_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Viewer bootstrap: fetch this viewer's current config.
    GetClientConfig { client_id: String },
    /// Admin bootstrap: fetch the full roster.
    GetClients {},
    /// Admin edits a viewer's region and/or display name.
    UpdateClientConfig {
        client_id: String,
        config: ClientConfigUpdate,
    },
    /// Broadcaster's SDP offer for a specific viewer.
    BroadcasterOffer {
        viewer_transport_id: String,
        sdp: serde_json::Value,
    },
    /// Viewer's SDP answer to the broadcaster's offer.
    ViewerAnswer { sdp: serde_json::Value },
    /// Broadcaster forwards an ICE candidate for a specific viewer.
    BroadcasterIceCandidate {
        viewer_transport_id: String,
        candidate: serde_json::Value,
    },
    /// Viewer forwards an ICE candidate to the broadcaster.
    ViewerIceCandidate { candidate: serde_json::Value },
}

/// An admin's requested edit to a viewer's config.
///
/// `region` is tri-state on the wire: the field may be absent (leave
/// unchanged), `null` (clear the region), or a `Rectangle` (set it). The
/// `deserialize_some` trick below is what makes that distinction visible —
/// a plain `Option<Rectangle>` would collapse "absent" and "null" together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfigUpdate {
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub region: Option<Option<Rectangle>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Messages sent by the hub to a participant (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full viewer record, sent to a viewer on bind and whenever its region
    /// changes in a way that requires the viewer to treat the stream as new.
    ClientConfig {
        #[serde(flatten)]
        record: ViewerRecord,
    },
    /// Region-only update to a viewer: the stream must NOT be torn down.
    RegionUpdate {
        client_id: String,
        region: Option<Rectangle>,
        geometry: Option<StreamGeometry>,
    },
    /// Full roster, sent to admins on bootstrap and on every roster change.
    ClientsUpdate { clients: Vec<ViewerRecord> },
    /// Initial stream dimensions, sent when a broadcaster registers.
    StreamDimensions { width: u32, height: u32 },
    /// Stream dimensions changed (new broadcaster, or geometry change).
    StreamDimensionsUpdate { width: u32, height: u32 },
    /// A viewer is ready to be bound, sent to the broadcaster. Carries the
    /// viewer's current region (if any already assigned) so the broadcaster
    /// can bind a real `Cropper` immediately instead of waiting on a region
    /// change that may never come (§8 assign-then-connect).
    NewViewer {
        viewer_transport_id: String,
        client_id: String,
        region: Option<Rectangle>,
    },
    /// A bound viewer's region changed, sent to the broadcaster.
    ClientRegionUpdated {
        client_id: String,
        region: Option<Rectangle>,
    },
    /// The broadcaster's offer, forwarded to a viewer.
    BroadcasterOffer { sdp: serde_json::Value },
    /// A viewer's answer, forwarded to the broadcaster.
    ViewerAnswer {
        viewer_transport_id: String,
        sdp: serde_json::Value,
    },
    /// The broadcaster's ICE candidate, forwarded to a viewer.
    BroadcasterIceCandidate { candidate: serde_json::Value },
    /// A viewer's ICE candidate, forwarded to the broadcaster.
    ViewerIceCandidate {
        viewer_transport_id: String,
        candidate: serde_json::Value,
    },
    /// A viewer's transport dropped, sent to the broadcaster.
    ViewerDisconnected { viewer_transport_id: String },
    /// The broadcaster's transport dropped, sent to every viewer and admin.
    BroadcasterDisconnected {},
    /// Bad input or an operation the registry rejected (§7).
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_broadcaster_kebab_case() {
        let msg = ClientMessage::RegisterBroadcaster {
            geometry: StreamGeometry::new(1920, 1080).unwrap(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"register-broadcaster""#));
        assert!(!json.contains("register_broadcaster"));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        matches!(parsed, ClientMessage::RegisterBroadcaster { .. });
    }

    #[test]
    fn register_viewer_roundtrip() {
        let msg = ClientMessage::RegisterViewer {
            client_id: "wall-a".into(),
            display_name: Some("Lobby A".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::RegisterViewer {
                client_id,
                display_name,
            } => {
                assert_eq!(client_id, "wall-a");
                assert_eq!(display_name.as_deref(), Some("Lobby A"));
            }
            _ => panic!("expected RegisterViewer"),
        }
    }

    #[test]
    fn update_client_config_distinguishes_absent_null_and_set() {
        // Field absent: don't touch the region.
        let absent: ClientConfigUpdate = serde_json::from_str(r#"{}"#).unwrap();
        assert!(absent.region.is_none());

        // Field explicit null: clear the region.
        let cleared: ClientConfigUpdate = serde_json::from_str(r#"{"region": null}"#).unwrap();
        assert_eq!(cleared.region, Some(None));

        // Field set: assign a region.
        let set: ClientConfigUpdate = serde_json::from_str(
            r#"{"region": {"x": 0, "y": 0, "width": 640, "height": 360}}"#,
        )
        .unwrap();
        assert_eq!(
            set.region,
            Some(Some(Rectangle::new(0, 0, 640, 360).unwrap()))
        );
    }

    #[test]
    fn broadcaster_offer_from_broadcaster_carries_viewer_transport_id() {
        let json = r#"{
            "type": "broadcaster-offer",
            "viewer_transport_id": "t-1",
            "sdp": {"type": "offer", "sdp": "v=0\r\n..."}
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::BroadcasterOffer {
                viewer_transport_id,
                ..
            } => assert_eq!(viewer_transport_id, "t-1"),
            _ => panic!("expected BroadcasterOffer"),
        }
    }

    #[test]
    fn server_broadcaster_offer_to_viewer_has_no_transport_id() {
        let msg = ServerMessage::BroadcasterOffer {
            sdp: serde_json::json!({"type": "offer", "sdp": "v=0\r\n..."}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("viewer_transport_id"));
    }

    #[test]
    fn client_config_flattens_viewer_record() {
        let record = ViewerRecord {
            client_id: "wall-a".into(),
            transport_id: Some("t-1".into()),
            display_name: None,
            connected: true,
            region: None,
            last_seen_at: 0,
        };
        let msg = ServerMessage::ClientConfig { record };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"client-config""#));
        assert!(json.contains(r#""client_id":"wall-a""#));
    }

    #[test]
    fn clients_update_roundtrip() {
        let msg = ServerMessage::ClientsUpdate { clients: vec![] };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        matches!(parsed, ServerMessage::ClientsUpdate { clients } if clients.is_empty());
    }

    #[test]
    fn broadcaster_disconnected_empty_payload() {
        let msg = ServerMessage::BroadcasterDisconnected {};
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"broadcaster-disconnected"}"#);
    }

    #[test]
    fn error_message_roundtrip() {
        let msg = ServerMessage::Error {
            code: "UNKNOWN_VIEWER".into(),
            message: "no such clientId".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerMessage::Error { code, .. } => assert_eq!(code, "UNKNOWN_VIEWER"),
            _ => panic!("expected Error"),
        }
    }
}
