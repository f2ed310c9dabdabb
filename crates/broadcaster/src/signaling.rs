//! Broadcaster-side signaling WebSocket client, grounded in
//! `beam-agent::signaling::run_signaling`'s reconnect-with-backoff shape.
//! TLS certificate pinning is dropped — transport setup is out of scope
//! here — and the raw JSON relay is replaced with the typed
//! `ClientMessage`/`ServerMessage` protocol.

use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wall_protocol::{ClientMessage, ServerMessage, StreamGeometry};

pub(crate) struct SignalingCtx {
    pub hub_url: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub geometry: StreamGeometry,
}

/// Runs the signaling connection until the process is told to shut down.
/// `outbox_rx` carries messages the coordinator wants sent to the hub;
/// `inbox_tx` carries messages received from the hub back to the coordinator.
/// On every (re)connect, `RegisterBroadcaster` is (re-)sent first so the hub
/// always knows the current stream geometry.
pub(crate) async fn run_signaling(
    ctx: &SignalingCtx,
    outbox_rx: &mut mpsc::Receiver<ClientMessage>,
    inbox_tx: &mpsc::Sender<ServerMessage>,
) {
    let mut backoff = ctx.reconnect_initial;
    loop {
        info!(url = %ctx.hub_url, "connecting to signaling hub");
        match connect_and_handle(ctx, outbox_rx, inbox_tx).await {
            Ok(()) => {
                info!("signaling connection closed cleanly");
                break;
            }
            Err(e) => {
                warn!("signaling connection error: {e:#}");
                info!("reconnecting in {}ms", backoff.as_millis());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(ctx.reconnect_max);
            }
        }
    }
}

async fn connect_and_handle(
    ctx: &SignalingCtx,
    outbox_rx: &mut mpsc::Receiver<ClientMessage>,
    inbox_tx: &mpsc::Sender<ServerMessage>,
) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (ws_stream, _) = tokio_tungstenite::connect_async(&ctx.hub_url)
        .await
        .context("WebSocket connection to hub failed")?;

    info!("connected to signaling hub");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let register = ClientMessage::RegisterBroadcaster {
        geometry: ctx.geometry,
    };
    ws_tx
        .send(Message::Text(serde_json::to_string(&register)?.into()))
        .await
        .context("failed to send RegisterBroadcaster")?;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(server_msg) => {
                                if inbox_tx.send(server_msg).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => warn!("malformed message from hub: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
            Some(msg) = outbox_rx.recv() => {
                let text = serde_json::to_string(&msg)?;
                ws_tx.send(Message::Text(text.into())).await?;
            }
        }
    }
}
