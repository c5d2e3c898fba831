//! Per-type callback registry with ordered fan-out.
//!
//! Callbacks are identified by opaque ids generated at registration, and a
//! message type may carry any number of callbacks; dispatch order is
//! registration order. Every invocation runs inside a failure boundary so
//! one misbehaving callback cannot starve the rest.

use crate::error::{Error, Result};
use crate::types::Envelope;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// A message callback, invoked with `(data, envelope)`.
pub type MessageCallback = Arc<dyn Fn(&Value, &Envelope) + Send + Sync>;

/// A (message type, callback) pair supplied by a subscriber.
#[derive(Clone)]
pub struct CallbackEntry {
    pub message_type: String,
    pub callback: MessageCallback,
}

impl CallbackEntry {
    pub fn new(
        message_type: impl Into<String>,
        callback: impl Fn(&Value, &Envelope) + Send + Sync + 'static,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            callback: Arc::new(callback),
        }
    }
}

struct Registered {
    id: String,
    callback: MessageCallback,
}

/// Ordered registry of callbacks, keyed by message type.
#[derive(Default)]
pub struct CallbackRegistry {
    by_type: HashMap<String, Vec<Registered>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, returning its generated id.
    pub fn register(&mut self, entry: CallbackEntry) -> Result<String> {
        self.register_with_id(entry, Uuid::new_v4().to_string())
    }

    /// Register a callback under a caller-chosen id (used when the id must
    /// match one already announced to the shared host).
    pub fn register_with_id(&mut self, entry: CallbackEntry, id: String) -> Result<String> {
        if entry.message_type.is_empty() {
            return Err(Error::InvalidSubscription(
                "message type must be non-empty".to_string(),
            ));
        }
        self.by_type
            .entry(entry.message_type)
            .or_default()
            .push(Registered {
                id: id.clone(),
                callback: entry.callback,
            });
        Ok(id)
    }

    /// Remove one callback by id, or every callback for the type when `id`
    /// is `None`. Returns how many were removed.
    pub fn unregister(&mut self, message_type: &str, id: Option<&str>) -> usize {
        let Some(list) = self.by_type.get_mut(message_type) else {
            return 0;
        };
        let before = list.len();
        match id {
            Some(id) => list.retain(|r| r.id != id),
            None => list.clear(),
        }
        let removed = before - list.len();
        if list.is_empty() {
            self.by_type.remove(message_type);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.by_type.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn has_type(&self, message_type: &str) -> bool {
        self.by_type.contains_key(message_type)
    }

    /// Callbacks registered for a type, in registration order.
    pub fn callbacks_for(&self, message_type: &str) -> Vec<MessageCallback> {
        self.by_type
            .get(message_type)
            .map(|list| list.iter().map(|r| Arc::clone(&r.callback)).collect())
            .unwrap_or_default()
    }

    /// Every (type, id) pair, for re-registration after a host reset.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .by_type
            .iter()
            .flat_map(|(t, list)| list.iter().map(move |r| (t.clone(), r.id.clone())))
            .collect();
        pairs.sort();
        pairs
    }
}

/// Invoke each callback with `(data, envelope)` inside a failure boundary;
/// a panic in one callback is logged and does not affect the others.
pub fn fan_out(callbacks: &[MessageCallback], envelope: &Envelope) {
    for callback in callbacks {
        let result = catch_unwind(AssertUnwindSafe(|| callback(&envelope.data, envelope)));
        if result.is_err() {
            error!(
                message_type = %envelope.message_type,
                "message callback panicked; continuing with remaining callbacks"
            );
        }
    }
}
