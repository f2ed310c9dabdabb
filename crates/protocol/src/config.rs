use serde::{Deserialize, Serialize};

/// Top-level configuration for the `wall-hub` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WallHubConfig {
    #[serde(default)]
    pub server: HubServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub event_hub: EventHubConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP/WebSocket port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to static assets for the admin/viewer web surfaces (not served
    /// by this crate, but passed through to whatever front-end is deployed
    /// alongside it)
    #[serde(default = "default_web_root")]
    pub web_root: String,
}

/// Session Registry tuning (§4.1, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Disconnected viewer records older than this are garbage-collected
    /// (§5, default 1800s / 30 minutes). 0 disables the sweep.
    #[serde(default = "default_stale_ttl_seconds")]
    pub stale_ttl_seconds: u64,
    /// How often the background GC sweep runs.
    #[serde(default = "default_gc_interval_seconds")]
    pub gc_interval_seconds: u64,
}

/// Event Hub tuning (§4.3, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHubConfig {
    /// Bounded per-participant outbound queue depth (§5, default 256).
    /// Exceeding it closes the transport.
    #[serde(default = "default_outbound_backlog")]
    pub outbound_backlog: usize,
    /// Region-change coalescing window in milliseconds (§4.3, at most 50ms).
    #[serde(default = "default_region_coalesce_ms")]
    pub region_coalesce_ms: u64,
    /// WebSocket ping interval, seconds.
    #[serde(default = "default_ping_interval_seconds")]
    pub ping_interval_seconds: u64,
    /// How long to wait for a pong before closing the transport, seconds.
    #[serde(default = "default_pong_timeout_seconds")]
    pub pong_timeout_seconds: u64,
}

/// Minimal auth seam (§1: authentication is an external collaborator,
/// contract only). Admin upgrades may optionally require a shared bearer
/// token; viewers and the broadcaster authenticate implicitly via their
/// clientId / registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// If set, admin WebSocket upgrades must present this token.
    pub admin_bearer_token: Option<String>,
}

impl Default for HubServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            web_root: default_web_root(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_ttl_seconds: default_stale_ttl_seconds(),
            gc_interval_seconds: default_gc_interval_seconds(),
        }
    }
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            outbound_backlog: default_outbound_backlog(),
            region_coalesce_ms: default_region_coalesce_ms(),
            ping_interval_seconds: default_ping_interval_seconds(),
            pong_timeout_seconds: default_pong_timeout_seconds(),
        }
    }
}

impl WallHubConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the hub should not start)
    /// or "WARNING:" (advisory, the hub can start but the config is likely
    /// wrong). Returns `Ok(())` if no issues were found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.registry.stale_ttl_seconds > 0 && self.registry.stale_ttl_seconds < 60 {
            issues.push(format!(
                "WARNING: registry.stale_ttl_seconds is {}, under a minute — reconnecting \
                 viewers may lose their region before they get back online.",
                self.registry.stale_ttl_seconds
            ));
        }

        if self.registry.gc_interval_seconds == 0 {
            issues.push(
                "ERROR: registry.gc_interval_seconds must be >= 1.".to_string(),
            );
        }

        if self.event_hub.outbound_backlog == 0 {
            issues.push(
                "ERROR: event_hub.outbound_backlog must be >= 1.".to_string(),
            );
        }

        if self.event_hub.region_coalesce_ms > 50 {
            issues.push(format!(
                "WARNING: event_hub.region_coalesce_ms is {}, above the 50ms coalescing \
                 window assumed by clients reasoning about region-update latency.",
                self.event_hub.region_coalesce_ms
            ));
        }

        if self.event_hub.pong_timeout_seconds <= self.event_hub.ping_interval_seconds {
            issues.push(format!(
                "ERROR: event_hub.pong_timeout_seconds ({}) must be greater than \
                 ping_interval_seconds ({}), or every participant will be disconnected \
                 on its first ping.",
                self.event_hub.pong_timeout_seconds, self.event_hub.ping_interval_seconds
            ));
        }

        if let Some(token) = &self.auth.admin_bearer_token {
            if token.trim().is_empty() {
                issues.push(
                    "WARNING: auth.admin_bearer_token is set but empty; the admin upgrade \
                     will reject every request until a real token is configured."
                        .to_string(),
                );
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Top-level configuration for the `wall-broadcaster` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WallBroadcasterConfig {
    #[serde(default)]
    pub hub: HubClientConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubClientConfig {
    /// WebSocket URL of the hub's broadcaster upgrade endpoint.
    #[serde(default = "default_hub_url")]
    pub url: String,
    /// Initial reconnect backoff, milliseconds.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Maximum reconnect backoff, milliseconds.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

/// ICE/TURN server configuration for WebRTC NAT traversal. STUN-only per
/// the Non-goals (§1); TURN URLs are accepted and passed through to the
/// peer connection but this crate never provisions a TURN server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// "screen", "camera", or "test-pattern" (used in integration tests).
    #[serde(default = "default_capture_source")]
    pub source: String,
    /// Output frame rate cap per cropper (§4.5, 30fps max).
    #[serde(default = "default_frame_rate_cap")]
    pub frame_rate_cap: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Offer-without-answer timeout (§5, default 15s).
    #[serde(default = "default_offer_timeout_seconds")]
    pub offer_timeout_seconds: u64,
    /// Pending-ICE queue capacity before oldest candidates are dropped
    /// (§4.4, §8: capacity 64).
    #[serde(default = "default_pending_ice_capacity")]
    pub pending_ice_capacity: usize,
}

impl Default for HubClientConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: default_capture_source(),
            frame_rate_cap: default_frame_rate_cap(),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            offer_timeout_seconds: default_offer_timeout_seconds(),
            pending_ice_capacity: default_pending_ice_capacity(),
        }
    }
}

impl WallBroadcasterConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.hub.url.trim().is_empty() {
            issues.push("ERROR: hub.url must not be empty.".to_string());
        }

        if self.hub.reconnect_max_ms < self.hub.reconnect_initial_ms {
            issues.push(format!(
                "ERROR: hub.reconnect_max_ms ({}) must be >= hub.reconnect_initial_ms ({}).",
                self.hub.reconnect_max_ms, self.hub.reconnect_initial_ms
            ));
        }

        if self.capture.frame_rate_cap == 0 || self.capture.frame_rate_cap > 30 {
            issues.push(format!(
                "ERROR: capture.frame_rate_cap must be between 1 and 30, got {}.",
                self.capture.frame_rate_cap
            ));
        }

        if !matches!(
            self.capture.source.as_str(),
            "screen" | "camera" | "test-pattern"
        ) {
            issues.push(format!(
                "ERROR: capture.source '{}' is not one of screen, camera, test-pattern.",
                self.capture.source
            ));
        }

        if self.negotiation.offer_timeout_seconds == 0 {
            issues.push(
                "ERROR: negotiation.offer_timeout_seconds must be >= 1.".to_string(),
            );
        }

        if self.negotiation.pending_ice_capacity == 0 {
            issues.push(
                "ERROR: negotiation.pending_ice_capacity must be >= 1.".to_string(),
            );
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_web_root() -> String {
    "web/dist".to_string()
}
fn default_stale_ttl_seconds() -> u64 {
    1800
}
fn default_gc_interval_seconds() -> u64 {
    60
}
fn default_outbound_backlog() -> usize {
    256
}
fn default_region_coalesce_ms() -> u64 {
    50
}
fn default_ping_interval_seconds() -> u64 {
    15
}
fn default_pong_timeout_seconds() -> u64 {
    45
}
fn default_hub_url() -> String {
    "ws://127.0.0.1:3000/ws/broadcaster".to_string()
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_capture_source() -> String {
    "screen".to_string()
}
fn default_frame_rate_cap() -> u32 {
    30
}
fn default_offer_timeout_seconds() -> u64 {
    15
}
fn default_pending_ice_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_hub_config() -> WallHubConfig {
        toml::from_str("").unwrap()
    }

    fn valid_broadcaster_config() -> WallBroadcasterConfig {
        toml::from_str("").unwrap()
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn hub_config_defaults() {
        let config = valid_hub_config();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.registry.stale_ttl_seconds, 1800);
        assert_eq!(config.event_hub.outbound_backlog, 256);
        assert_eq!(config.event_hub.region_coalesce_ms, 50);
        assert!(config.auth.admin_bearer_token.is_none());
    }

    #[test]
    fn hub_config_defaults_are_valid() {
        assert!(valid_hub_config().validate().is_ok());
    }

    #[test]
    fn hub_config_port_zero_is_error() {
        let mut config = valid_hub_config();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "port"));
    }

    #[test]
    fn hub_config_backlog_zero_is_error() {
        let mut config = valid_hub_config();
        config.event_hub.outbound_backlog = 0;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "outbound_backlog"));
    }

    #[test]
    fn hub_config_coalesce_window_over_50ms_is_warning() {
        let mut config = valid_hub_config();
        config.event_hub.region_coalesce_ms = 250;
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues, "region_coalesce_ms"));
    }

    #[test]
    fn hub_config_pong_timeout_must_exceed_ping_interval() {
        let mut config = valid_hub_config();
        config.event_hub.ping_interval_seconds = 30;
        config.event_hub.pong_timeout_seconds = 30;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "pong_timeout_seconds"));
    }

    #[test]
    fn hub_config_empty_bearer_token_is_warning() {
        let mut config = valid_hub_config();
        config.auth.admin_bearer_token = Some("  ".to_string());
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues, "admin_bearer_token"));
    }

    #[test]
    fn broadcaster_config_defaults() {
        let config = valid_broadcaster_config();
        assert_eq!(config.capture.frame_rate_cap, 30);
        assert_eq!(config.capture.source, "screen");
        assert_eq!(config.negotiation.offer_timeout_seconds, 15);
        assert_eq!(config.negotiation.pending_ice_capacity, 64);
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
    }

    #[test]
    fn broadcaster_config_defaults_are_valid() {
        assert!(valid_broadcaster_config().validate().is_ok());
    }

    #[test]
    fn broadcaster_config_empty_hub_url_is_error() {
        let mut config = valid_broadcaster_config();
        config.hub.url = "".to_string();
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "hub.url"));
    }

    #[test]
    fn broadcaster_config_frame_rate_above_30_is_error() {
        let mut config = valid_broadcaster_config();
        config.capture.frame_rate_cap = 60;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "frame_rate_cap"));
    }

    #[test]
    fn broadcaster_config_unknown_capture_source_is_error() {
        let mut config = valid_broadcaster_config();
        config.capture.source = "microphone".to_string();
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "capture.source"));
    }

    #[test]
    fn broadcaster_config_stun_url_bad_prefix_is_error() {
        let mut config = valid_broadcaster_config();
        config.ice.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "STUN URL"));
    }

    #[test]
    fn broadcaster_config_turn_url_bad_prefix_is_error() {
        let mut config = valid_broadcaster_config();
        config.ice.turn_urls = vec!["http://turn.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "TURN URL"));
    }

    #[test]
    fn broadcaster_config_reconnect_max_below_initial_is_error() {
        let mut config = valid_broadcaster_config();
        config.hub.reconnect_initial_ms = 5000;
        config.hub.reconnect_max_ms = 1000;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "reconnect_max_ms"));
    }
}
