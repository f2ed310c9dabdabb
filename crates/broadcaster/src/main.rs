mod cli;
mod config;
mod coordinator;
mod cropper;
mod encoder;
mod signaling;
mod source;
mod viewer_session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_server::RTCIceServer;

use wall_protocol::StreamGeometry;

use crate::coordinator::Coordinator;
use crate::signaling::SignalingCtx;
use crate::source::{FrameSource, TestPatternSource};

const CAPTURE_WIDTH: u32 = 1920;
const CAPTURE_HEIGHT: u32 = 1080;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = gstreamer::init() {
        tracing::error!("failed to initialize GStreamer: {e:#}");
        std::process::exit(2);
    }

    let args = cli::parse_args()?;
    let mut wall_config = config::load_config(&args.config_path)?;
    if let Some(url) = args.hub_url {
        wall_config.hub.url = url;
    }
    if let Some(source_name) = args.capture_source {
        wall_config.capture.source = source_name;
    }

    if let Err(issues) = wall_config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(2);
        }
    }

    if !matches!(wall_config.capture.source.as_str(), "test-pattern") {
        tracing::warn!(
            "capture.source '{}' has no real capture backend in this build; \
             falling back to a synthetic test pattern.",
            wall_config.capture.source
        );
    }
    let source: Arc<dyn FrameSource> = TestPatternSource::start(
        CAPTURE_WIDTH,
        CAPTURE_HEIGHT,
        wall_config.capture.frame_rate_cap,
    );

    let ice_servers = vec![RTCIceServer {
        urls: wall_config.ice.stun_urls.clone(),
        username: wall_config.ice.turn_username.clone().unwrap_or_default(),
        credential: wall_config.ice.turn_credential.clone().unwrap_or_default(),
        ..Default::default()
    }];

    let geometry = StreamGeometry::new(source.width(), source.height())
        .expect("capture dimensions are always positive");

    let (outbox_tx, mut outbox_rx) = mpsc::channel(64);
    let (inbox_tx, mut inbox_rx) = mpsc::channel(64);

    let coordinator = Coordinator::new(
        outbox_tx.clone(),
        Arc::clone(&source),
        ice_servers,
        wall_config.negotiation.pending_ice_capacity,
        Duration::from_secs(wall_config.negotiation.offer_timeout_seconds),
        wall_config.capture.frame_rate_cap,
    );

    tokio::spawn(async move {
        while let Some(msg) = inbox_rx.recv().await {
            coordinator.handle(msg).await;
        }
    });

    let signaling_ctx = SignalingCtx {
        hub_url: wall_config.hub.url.clone(),
        reconnect_initial: Duration::from_millis(wall_config.hub.reconnect_initial_ms),
        reconnect_max: Duration::from_millis(wall_config.hub.reconnect_max_ms),
        geometry,
    };

    tracing::info!("===========================================");
    tracing::info!("  Wall broadcaster");
    tracing::info!("  Hub: {}", signaling_ctx.hub_url);
    tracing::info!("===========================================");

    signaling::run_signaling(&signaling_ctx, &mut outbox_rx, &inbox_tx).await;

    tracing::info!("wall broadcaster shut down cleanly");
    Ok(())
}
