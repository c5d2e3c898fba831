//! Core wire types: envelopes, session identity, outbound payloads.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

/// Current time in millis since Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The typed message record carried on the upstream stream and replayed
/// between host and tabs.
///
/// `type` is the only required field; frames without it are dropped before
/// an `Envelope` is ever built (see [`parse_envelope`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Build an envelope with just a type and data.
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            meta: None,
            timestamp: None,
        }
    }

    /// The default heartbeat envelope: `{"type":"PING","timestamp":<ms>}`.
    pub fn ping() -> Self {
        Self {
            message_type: "PING".to_string(),
            data: Value::Null,
            meta: None,
            timestamp: Some(now_ms()),
        }
    }
}

/// Parse one inbound text frame.
///
/// - Malformed JSON is an error (callers log it at warn and drop the frame).
/// - Valid JSON without a string `type` yields `Ok(None)` (dropped silently).
pub fn parse_envelope(text: &str) -> std::result::Result<Option<Envelope>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    match value.get("type").and_then(Value::as_str) {
        Some(t) if !t.is_empty() => {}
        _ => return Ok(None),
    }
    Ok(Some(serde_json::from_value(value)?))
}

/// An outbound payload: raw text, or a JSON value serialized before sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Json(Value),
}

impl Payload {
    /// Serialize into the text frame that goes on the wire.
    pub fn into_text(self) -> Result<String> {
        match self {
            Payload::Text(text) => Ok(text),
            Payload::Json(value) => Ok(serde_json::to_string(&value)?),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<&Envelope> for Payload {
    fn from(envelope: &Envelope) -> Self {
        Payload::Json(serde_json::to_value(envelope).unwrap_or(Value::Null))
    }
}

/// The (base_url, user_id, credential) triple that selects one upstream
/// stream. Two identities are equal iff all three components are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub base_url: String,
    pub user_id: String,
    pub credential: String,
}

impl SessionIdentity {
    pub fn new(
        base_url: impl Into<String>,
        user_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            user_id: user_id.into(),
            credential: credential.into(),
        }
    }

    /// Derive the resolved stream URL: `{base_url}/{user_id}?token={enc}`.
    ///
    /// The credential is query-encoded; no other parameters are appended.
    pub fn stream_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("invalid base url {:?}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("base url {:?} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(&self.user_id);
        url.query_pairs_mut().append_pair("token", &self.credential);
        Ok(url.into())
    }
}
