//! Cross-session shared connection: a single host task owns the upstream
//! stream and fans it out to every attached session in the process.

mod client;
mod host;
mod proto;
pub mod registry;

pub use client::{SharedClient, SharedClientOptions, SharedHooks};
pub use host::{HostOptions, SharedHost};
pub use proto::{HostMessage, PortFrame, TabFrame, TabMessage, UpstreamSettings, PORT_CAPACITY};
pub use registry::DEFAULT_HOST_NAME;
