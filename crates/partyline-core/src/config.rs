//! Client configuration and the partial-merge layer.

use crate::types::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Factory for the recurring heartbeat envelope.
pub type HeartbeatFactory = Arc<dyn Fn() -> Envelope + Send + Sync>;

/// Connection strategy requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Pick the best supported strategy: shared, then visibility, then direct.
    Auto,
    /// One upstream shared by every attached session in the process.
    Shared,
    /// A per-session upstream scoped to the visibility feed.
    Visibility,
    /// A plain per-session upstream.
    Direct,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Auto => "auto",
            ConnectionMode::Shared => "shared",
            ConnectionMode::Visibility => "visibility",
            ConnectionMode::Direct => "direct",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(ConnectionMode::Auto),
            "shared" => Some(ConnectionMode::Shared),
            "visibility" => Some(ConnectionMode::Visibility),
            "direct" => Some(ConnectionMode::Direct),
            _ => None,
        }
    }
}

/// Client configuration.
///
/// The visibility and network feeds are injectable `watch` receivers so the
/// owning application decides what "visible" and "online" mean; tests drive
/// them directly.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base stream URL, e.g. `wss://host/ws`. Required before `start`.
    pub url: Option<String>,
    /// Heartbeat emission period while the stream is open.
    pub heartbeat_interval: Duration,
    /// Reconnect attempt ceiling before giving up until a fresh trigger.
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay; attempt n waits `delay * n`, clamped.
    pub reconnect_delay: Duration,
    /// Clamp for the linear backoff.
    pub reconnect_delay_max: Duration,
    /// Whether unexpected closes schedule a reconnect at all.
    pub auto_reconnect: bool,
    /// Replacement heartbeat envelope factory; default is the PING envelope.
    pub heartbeat_message: Option<HeartbeatFactory>,
    /// Log level hint applied by binaries ("silent" maps to "off").
    pub log_level: Option<String>,
    /// Allow the visibility-scoped strategy in auto mode.
    pub enable_visibility_management: bool,
    /// Requested connection strategy.
    pub connection_mode: ConnectionMode,
    /// How long all sessions may stay hidden before the upstream is closed.
    pub shared_idle_timeout: Duration,
    /// Tear down and reopen even when start() sees an unchanged identity.
    pub force_new_on_start: bool,
    /// Whether the network feed (when present) is wired into reconnection.
    pub enable_network_listener: bool,
    /// True while the owning session is visible/foreground.
    pub visibility: Option<watch::Receiver<bool>>,
    /// True while the machine believes it is online.
    pub network: Option<watch::Receiver<bool>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_interval: Duration::from_millis(25_000),
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_millis(3_000),
            reconnect_delay_max: Duration::from_millis(10_000),
            auto_reconnect: true,
            heartbeat_message: None,
            log_level: None,
            enable_visibility_management: false,
            connection_mode: ConnectionMode::Auto,
            shared_idle_timeout: Duration::from_millis(30_000),
            force_new_on_start: false,
            enable_network_listener: true,
            visibility: None,
            network: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("reconnect_delay_max", &self.reconnect_delay_max)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("connection_mode", &self.connection_mode)
            .field("shared_idle_timeout", &self.shared_idle_timeout)
            .field("force_new_on_start", &self.force_new_on_start)
            .field("enable_network_listener", &self.enable_network_listener)
            .field("enable_visibility_management", &self.enable_visibility_management)
            .finish_non_exhaustive()
    }
}

/// Partial configuration; only the fields that are `Some` are applied.
#[derive(Clone, Default)]
pub struct ConfigPatch {
    pub url: Option<String>,
    pub heartbeat_interval: Option<Duration>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay: Option<Duration>,
    pub reconnect_delay_max: Option<Duration>,
    pub auto_reconnect: Option<bool>,
    pub heartbeat_message: Option<HeartbeatFactory>,
    pub log_level: Option<String>,
    pub enable_visibility_management: Option<bool>,
    pub connection_mode: Option<ConnectionMode>,
    pub shared_idle_timeout: Option<Duration>,
    pub force_new_on_start: Option<bool>,
    pub enable_network_listener: Option<bool>,
    pub visibility: Option<watch::Receiver<bool>>,
    pub network: Option<watch::Receiver<bool>>,
}

impl ConfigPatch {
    /// Apply every populated field onto `config`.
    pub fn apply_to(self, config: &mut ClientConfig) {
        if let Some(v) = self.url {
            config.url = Some(v);
        }
        if let Some(v) = self.heartbeat_interval {
            config.heartbeat_interval = v;
        }
        if let Some(v) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = self.reconnect_delay {
            config.reconnect_delay = v;
        }
        if let Some(v) = self.reconnect_delay_max {
            config.reconnect_delay_max = v;
        }
        if let Some(v) = self.auto_reconnect {
            config.auto_reconnect = v;
        }
        if let Some(v) = self.heartbeat_message {
            config.heartbeat_message = Some(v);
        }
        if let Some(v) = self.log_level {
            config.log_level = Some(v);
        }
        if let Some(v) = self.enable_visibility_management {
            config.enable_visibility_management = v;
        }
        if let Some(v) = self.connection_mode {
            config.connection_mode = v;
        }
        if let Some(v) = self.shared_idle_timeout {
            config.shared_idle_timeout = v;
        }
        if let Some(v) = self.force_new_on_start {
            config.force_new_on_start = v;
        }
        if let Some(v) = self.enable_network_listener {
            config.enable_network_listener = v;
        }
        if let Some(v) = self.visibility {
            config.visibility = Some(v);
        }
        if let Some(v) = self.network {
            config.network = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(25_000));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.reconnect_delay, Duration::from_millis(3_000));
        assert_eq!(config.reconnect_delay_max, Duration::from_millis(10_000));
        assert!(config.auto_reconnect);
        assert!(!config.enable_visibility_management);
        assert_eq!(config.connection_mode, ConnectionMode::Auto);
        assert_eq!(config.shared_idle_timeout, Duration::from_millis(30_000));
        assert!(!config.force_new_on_start);
        assert!(config.enable_network_listener);
    }

    #[test]
    fn test_patch_applies_only_populated_fields() {
        let mut config = ClientConfig::default();
        let patch = ConfigPatch {
            url: Some("wss://s/ws".to_string()),
            max_reconnect_attempts: Some(3),
            connection_mode: Some(ConnectionMode::Direct),
            ..Default::default()
        };
        patch.apply_to(&mut config);

        assert_eq!(config.url.as_deref(), Some("wss://s/ws"));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.connection_mode, ConnectionMode::Direct);
        // Untouched fields keep their defaults.
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_delay, Duration::from_millis(3_000));
    }

    #[test]
    fn test_later_patch_wins() {
        let mut config = ClientConfig::default();
        ConfigPatch {
            url: Some("wss://a/ws".to_string()),
            ..Default::default()
        }
        .apply_to(&mut config);
        ConfigPatch {
            url: Some("wss://b/ws".to_string()),
            ..Default::default()
        }
        .apply_to(&mut config);
        assert_eq!(config.url.as_deref(), Some("wss://b/ws"));
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            ConnectionMode::Auto,
            ConnectionMode::Shared,
            ConnectionMode::Visibility,
            ConnectionMode::Direct,
        ] {
            assert_eq!(ConnectionMode::from_str(mode.as_str()), Some(mode));
        }
        assert_eq!(ConnectionMode::from_str("bogus"), None);
    }
}
