//! Tab ↔ host wire protocol.
//!
//! Every port message is a `{type, payload?, tabId (tab→host only),
//! timestamp}` map; the message kinds are literal SCREAMING_SNAKE_CASE
//! strings. Channels carry the typed frames directly; the serde shapes
//! define (and pin) the wire representation.

use crate::config::ClientConfig;
use crate::types::{now_ms, Envelope, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Capacity of each host→tab port.
pub const PORT_CAPACITY: usize = 256;

/// The serializable slice of [`ClientConfig`] a tab hands to the host so
/// the host can shape the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSettings {
    pub heartbeat_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl UpstreamSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            heartbeat_interval_ms: config.heartbeat_interval.as_millis() as u64,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay_ms: config.reconnect_delay.as_millis() as u64,
            reconnect_delay_max_ms: config.reconnect_delay_max.as_millis() as u64,
        }
    }

    /// Materialize a config for the host-owned upstream. The host drives
    /// reconnection itself, so auto-reconnect is off here.
    pub fn into_upstream_config(&self, url: String) -> ClientConfig {
        ClientConfig {
            url: Some(url),
            heartbeat_interval: std::time::Duration::from_millis(self.heartbeat_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: std::time::Duration::from_millis(self.reconnect_delay_ms),
            reconnect_delay_max: std::time::Duration::from_millis(self.reconnect_delay_max_ms),
            auto_reconnect: false,
            ..Default::default()
        }
    }
}

/// Messages a tab sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabMessage {
    #[serde(rename_all = "camelCase")]
    TabInit {
        url: String,
        user_id: String,
        credential: String,
        is_visible: bool,
        settings: UpstreamSettings,
        idle_timeout_ms: u64,
    },
    TabDisconnect,
    TabSend {
        data: Payload,
    },
    #[serde(rename_all = "camelCase")]
    TabVisibility {
        is_visible: bool,
    },
    #[serde(rename_all = "camelCase")]
    TabRegisterCallback {
        message_type: String,
        callback_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TabUnregisterCallback {
        message_type: String,
        callback_id: Option<String>,
    },
    TabPing,
    TabForceReset {
        reason: Option<String>,
    },
    TabForceShutdown {
        reason: Option<String>,
    },
    TabNetworkOnline,
}

/// Messages the host sends to a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostMessage {
    WorkerReady,
    WorkerConnected,
    WorkerDisconnected,
    #[serde(rename_all = "camelCase")]
    WorkerMessage {
        original_frame: String,
        envelope: Envelope,
    },
    WorkerError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    WorkerAuthConflict {
        current_user_id: String,
        new_user_id: String,
        explanation: String,
    },
    WorkerPong,
    WorkerTabNotFound,
}

/// One tab→host frame: the message plus sender identity and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabFrame {
    pub tab_id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub message: TabMessage,
}

impl TabFrame {
    pub fn new(tab_id: impl Into<String>, message: TabMessage) -> Self {
        Self {
            tab_id: tab_id.into(),
            timestamp: now_ms(),
            message,
        }
    }
}

/// The channel-level wrapper the host receives: the frame plus the port to
/// answer on. The port is how the host reaches tabs it does not know yet
/// (or no longer knows) to tell them to reinitialize.
pub struct PortFrame {
    pub frame: TabFrame,
    pub port: mpsc::Sender<HostMessage>,
}
