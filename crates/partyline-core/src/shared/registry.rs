//! Process-wide host registry.
//!
//! All sessions that attach under the same well-known name land on the same
//! host task; the name plays the role the byte-identical worker script URL
//! plays in a browser. A host whose frame channel has closed (shutdown) is
//! replaced on the next attach.

use crate::error::{Error, Result};
use crate::shared::host::{HostOptions, SharedHost};
use crate::shared::proto::PortFrame;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tokio::sync::mpsc;

/// The default well-known host name all facade sessions share.
pub const DEFAULT_HOST_NAME: &str = "partyline-shared-host";

const FRAME_CAPACITY: usize = 256;

static HOSTS: OnceLock<Mutex<HashMap<String, mpsc::Sender<PortFrame>>>> = OnceLock::new();

/// Whether a shared host could be spawned from this context.
pub fn host_supported() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// Attach to the host registered under `name`, spawning it if it does not
/// exist (or its previous incarnation has shut down).
pub fn attach(name: &str, options: HostOptions) -> Result<mpsc::Sender<PortFrame>> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
        Error::HostUnavailable("no async runtime available to spawn the shared host".to_string())
    })?;

    let mut hosts = HOSTS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap();

    if let Some(frame_tx) = hosts.get(name) {
        if !frame_tx.is_closed() {
            return Ok(frame_tx.clone());
        }
    }

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CAPACITY);
    runtime.spawn(SharedHost::new(frame_rx, options).run());
    hosts.insert(name.to_string(), frame_tx.clone());
    Ok(frame_tx)
}
