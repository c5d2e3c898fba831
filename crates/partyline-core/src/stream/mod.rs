//! Low-level stream client: one authenticated WebSocket session with
//! heartbeat, bounded reconnection, and per-type callback fan-out.

mod backoff;
mod client;
mod dispatch;

pub use backoff::ReconnectPolicy;
pub use client::{ReadyState, StreamClient, StreamHooks};
pub use dispatch::{fan_out, CallbackEntry, CallbackRegistry, MessageCallback};
