//! partyline: one authenticated upstream stream shared by every session of
//! a process.
//!
//! A naive client opens one socket per session, leaks the credential across
//! duplicate connections, and loses messages whenever a session goes away.
//! partyline routes everything through a single upstream instead:
//!
//! - [`stream::StreamClient`] — a reconnecting stream session with
//!   heartbeat, bounded linear backoff, network awareness, and per-type
//!   callback fan-out.
//! - [`shared::SharedHost`] / [`shared::SharedClient`] — a process-wide
//!   host task that owns the upstream and coordinates attached sessions:
//!   per-session subscription state, idle shutdown while every session is
//!   hidden, identity-change handling, last-envelope replay for late
//!   joiners, a stale-session sweep, and a fast-close circuit breaker.
//! - [`facade::Facade`] — a uniform entry point that picks the shared,
//!   visibility-scoped, or per-session strategy and degrades gracefully
//!   where a strategy is unavailable.

pub mod config;
pub mod error;
pub mod facade;
pub mod shared;
pub mod stream;
pub mod types;

pub use config::{ClientConfig, ConfigPatch, ConnectionMode};
pub use error::{Error, Result};
pub use facade::{Facade, FacadeOptions, StartOptions};
pub use shared::{SharedClient, SharedClientOptions, SharedHooks};
pub use stream::{CallbackEntry, ReadyState, StreamClient, StreamHooks};
pub use types::{Envelope, Payload, SessionIdentity};
