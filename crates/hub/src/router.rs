//! Signal Router (§4.2): pure forwarding of SDP/ICE messages, addressed by
//! viewer identity. Deliberately not a struct with its own state — free
//! functions closing over the registry (for identity lookups) and the
//! Event Hub (for delivery), matching `signaling.rs`'s stateless relay.

use wall_protocol::ServerMessage;

use crate::event_hub::EventHub;

/// Broadcaster's SDP offer for a specific viewer transport (§4.2 rule 1:
/// dropped with a warning if that viewer is gone — never queued).
pub async fn forward_broadcaster_offer(
    hub: &EventHub,
    viewer_transport_id: &str,
    sdp: serde_json::Value,
) {
    let delivered = hub
        .send_to(viewer_transport_id, ServerMessage::BroadcasterOffer { sdp })
        .await;
    if !delivered {
        tracing::warn!(
            viewer_transport_id,
            "dropped broadcaster-offer: viewer transport not present"
        );
    }
}

/// Viewer's SDP answer, tagged with the viewer's transportId so the
/// broadcaster can address the right Viewer Session.
pub async fn forward_viewer_answer(
    hub: &EventHub,
    broadcaster_transport_id: Option<&str>,
    viewer_transport_id: &str,
    sdp: serde_json::Value,
) {
    let Some(broadcaster_transport_id) = broadcaster_transport_id else {
        tracing::warn!(
            viewer_transport_id,
            "dropped viewer-answer: no broadcaster registered"
        );
        return;
    };
    let delivered = hub
        .send_to(
            broadcaster_transport_id,
            ServerMessage::ViewerAnswer {
                viewer_transport_id: viewer_transport_id.to_string(),
                sdp,
            },
        )
        .await;
    if !delivered {
        tracing::warn!(
            viewer_transport_id,
            "dropped viewer-answer: broadcaster transport not present"
        );
    }
}

pub async fn forward_broadcaster_ice(
    hub: &EventHub,
    viewer_transport_id: &str,
    candidate: serde_json::Value,
) {
    let delivered = hub
        .send_to(
            viewer_transport_id,
            ServerMessage::BroadcasterIceCandidate { candidate },
        )
        .await;
    if !delivered {
        tracing::warn!(
            viewer_transport_id,
            "dropped broadcaster-ice-candidate: viewer transport not present"
        );
    }
}

pub async fn forward_viewer_ice(
    hub: &EventHub,
    broadcaster_transport_id: Option<&str>,
    viewer_transport_id: &str,
    candidate: serde_json::Value,
) {
    let Some(broadcaster_transport_id) = broadcaster_transport_id else {
        tracing::warn!(
            viewer_transport_id,
            "dropped viewer-ice-candidate: no broadcaster registered"
        );
        return;
    };
    let delivered = hub
        .send_to(
            broadcaster_transport_id,
            ServerMessage::ViewerIceCandidate {
                viewer_transport_id: viewer_transport_id.to_string(),
                candidate,
            },
        )
        .await;
    if !delivered {
        tracing::warn!(
            viewer_transport_id,
            "dropped viewer-ice-candidate: broadcaster transport not present"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_hub::Role;

    #[tokio::test]
    async fn broadcaster_offer_reaches_the_named_viewer() {
        let hub = EventHub::new(8);
        let mut viewer_rx = hub
            .register("v1".into(), Role::Viewer { client_id: "wall-a".into() })
            .await;

        forward_broadcaster_offer(&hub, "v1", serde_json::json!({"sdp": "offer"})).await;

        let msg = viewer_rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::BroadcasterOffer { .. }));
    }

    #[tokio::test]
    async fn broadcaster_offer_to_missing_viewer_is_dropped_not_queued() {
        let hub = EventHub::new(8);
        // No viewer registered at all; this must not panic or block.
        forward_broadcaster_offer(&hub, "ghost", serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn viewer_answer_is_tagged_with_viewer_transport_id() {
        let hub = EventHub::new(8);
        let mut broadcaster_rx = hub.register("b1".into(), Role::Broadcaster).await;

        forward_viewer_answer(&hub, Some("b1"), "v1", serde_json::json!({"sdp": "answer"})).await;

        match broadcaster_rx.recv().await.unwrap() {
            ServerMessage::ViewerAnswer {
                viewer_transport_id,
                ..
            } => assert_eq!(viewer_transport_id, "v1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn viewer_answer_with_no_broadcaster_is_dropped() {
        let hub = EventHub::new(8);
        forward_viewer_answer(&hub, None, "v1", serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn ice_candidates_forward_both_directions() {
        let hub = EventHub::new(8);
        let mut viewer_rx = hub
            .register("v1".into(), Role::Viewer { client_id: "wall-a".into() })
            .await;
        let mut broadcaster_rx = hub.register("b1".into(), Role::Broadcaster).await;

        forward_broadcaster_ice(&hub, "v1", serde_json::json!({"candidate": "x"})).await;
        assert!(matches!(
            viewer_rx.recv().await.unwrap(),
            ServerMessage::BroadcasterIceCandidate { .. }
        ));

        forward_viewer_ice(&hub, Some("b1"), "v1", serde_json::json!({"candidate": "y"})).await;
        assert!(matches!(
            broadcaster_rx.recv().await.unwrap(),
            ServerMessage::ViewerIceCandidate { .. }
        ));
    }
}
