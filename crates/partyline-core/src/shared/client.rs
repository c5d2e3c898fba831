//! SharedClient: the per-session proxy onto the shared host.
//!
//! Mirrors the stream-client surface but delegates everything over the
//! host's frame channel. Local callbacks are kept in a registry so the
//! session can rebuild its host-side state after the host reaped it or was
//! reset (WORKER_TAB_NOT_FOUND → re-init + re-register).

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::shared::host::HostOptions;
use crate::shared::proto::{
    HostMessage, PortFrame, TabFrame, TabMessage, UpstreamSettings, PORT_CAPACITY,
};
use crate::shared::registry::{self, DEFAULT_HOST_NAME};
use crate::stream::{fan_out, CallbackEntry, CallbackRegistry};
use crate::types::{Payload, SessionIdentity};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Liveness heartbeat period towards the host.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(10_000);

/// Lifecycle hooks surfaced to the owner.
#[derive(Clone, Default)]
pub struct SharedHooks {
    pub on_connected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_disconnected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Invoked with (current_user_id, new_user_id).
    pub on_auth_conflict: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

/// Options for a shared client session.
pub struct SharedClientOptions {
    pub host_name: String,
    pub identity: SessionIdentity,
    pub config: ClientConfig,
    /// Test seam: attach to this frame channel instead of the registry.
    pub(crate) attach: Option<mpsc::Sender<PortFrame>>,
}

impl SharedClientOptions {
    pub fn new(identity: SessionIdentity, config: ClientConfig) -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_string(),
            identity,
            config,
            attach: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_attach(mut self, attach: mpsc::Sender<PortFrame>) -> Self {
        self.attach = Some(attach);
        self
    }
}

/// Everything a task needs to rebuild this tab's host-side state.
struct InitContext {
    tab_id: String,
    identity: SessionIdentity,
    settings: UpstreamSettings,
    idle_timeout_ms: u64,
    visible: AtomicBool,
}

impl InitContext {
    fn init_message(&self) -> TabMessage {
        TabMessage::TabInit {
            url: self.identity.base_url.clone(),
            user_id: self.identity.user_id.clone(),
            credential: self.identity.credential.clone(),
            is_visible: self.visible.load(Ordering::SeqCst),
            settings: self.settings.clone(),
            idle_timeout_ms: self.idle_timeout_ms,
        }
    }
}

/// One attached session on the shared host.
pub struct SharedClient {
    ctx: Arc<InitContext>,
    hooks: SharedHooks,
    registry: Arc<StdMutex<CallbackRegistry>>,
    connected: Arc<AtomicBool>,
    host_name: String,
    visibility: Option<watch::Receiver<bool>>,
    network: Option<watch::Receiver<bool>>,
    attach_override: Option<mpsc::Sender<PortFrame>>,

    frame_tx: Option<mpsc::Sender<PortFrame>>,
    port_tx: Option<mpsc::Sender<HostMessage>>,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl SharedClient {
    pub fn new(options: SharedClientOptions, hooks: SharedHooks) -> Self {
        let visible = options
            .config
            .visibility
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(true);
        let ctx = Arc::new(InitContext {
            tab_id: format!("tab-{}", Uuid::new_v4()),
            identity: options.identity,
            settings: UpstreamSettings::from_config(&options.config),
            idle_timeout_ms: options.config.shared_idle_timeout.as_millis() as u64,
            visible: AtomicBool::new(visible),
        });
        let network = if options.config.enable_network_listener {
            options.config.network.clone()
        } else {
            None
        };
        Self {
            ctx,
            hooks,
            registry: Arc::new(StdMutex::new(CallbackRegistry::new())),
            connected: Arc::new(AtomicBool::new(false)),
            host_name: options.host_name,
            visibility: options.config.visibility.clone(),
            network,
            attach_override: options.attach,
            frame_tx: None,
            port_tx: None,
            tasks: Vec::new(),
            stopped: false,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.ctx.tab_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Attach to the shared host, register this tab, and start the ambient
    /// tasks (port pump, liveness ping, visibility and network feeds).
    pub async fn start(&mut self) -> Result<()> {
        if self.frame_tx.is_some() {
            return Ok(());
        }
        let frame_tx = match &self.attach_override {
            Some(frame_tx) => frame_tx.clone(),
            None => registry::attach(&self.host_name, HostOptions::default())?,
        };
        let (port_tx, port_rx) = mpsc::channel(PORT_CAPACITY);

        send_frame(&frame_tx, &port_tx, &self.ctx.tab_id, self.ctx.init_message()).await?;
        info!(tab_id = %self.ctx.tab_id, host = %self.host_name, "attached to shared host");

        self.tasks.push(tokio::spawn(port_pump(
            port_rx,
            Arc::clone(&self.ctx),
            Arc::clone(&self.registry),
            Arc::clone(&self.connected),
            self.hooks.clone(),
            frame_tx.clone(),
            port_tx.clone(),
        )));
        self.tasks.push(tokio::spawn(liveness_pump(
            Arc::clone(&self.ctx),
            frame_tx.clone(),
            port_tx.clone(),
        )));
        if let Some(rx) = self.visibility.clone() {
            self.tasks.push(tokio::spawn(visibility_pump(
                rx,
                Arc::clone(&self.ctx),
                Arc::clone(&self.registry),
                Arc::clone(&self.connected),
                frame_tx.clone(),
                port_tx.clone(),
            )));
        }
        if let Some(rx) = self.network.clone() {
            self.tasks.push(tokio::spawn(network_pump(
                rx,
                Arc::clone(&self.ctx),
                frame_tx.clone(),
                port_tx.clone(),
            )));
        }

        self.frame_tx = Some(frame_tx);
        self.port_tx = Some(port_tx);
        self.stopped = false;
        Ok(())
    }

    /// Detach this tab. Other sessions keep their shared upstream.
    pub async fn stop(&mut self) {
        if let Ok((frame_tx, port_tx)) = self.channels() {
            let _ = send_frame(&frame_tx, &port_tx, &self.ctx.tab_id, TabMessage::TabDisconnect)
                .await;
        }
        self.teardown();
    }

    /// Ask the host to tear everything down for every session, then detach.
    pub async fn force_shutdown(&mut self, reason: Option<String>) {
        if let Ok((frame_tx, port_tx)) = self.channels() {
            let _ = send_frame(
                &frame_tx,
                &port_tx,
                &self.ctx.tab_id,
                TabMessage::TabForceShutdown { reason },
            )
            .await;
        }
        self.teardown();
    }

    /// Ask the host to drop its upstream and session state but keep every
    /// tab attached.
    pub async fn force_reset(&self, reason: Option<String>) -> Result<()> {
        let (frame_tx, port_tx) = self.channels()?;
        send_frame(
            &frame_tx,
            &port_tx,
            &self.ctx.tab_id,
            TabMessage::TabForceReset { reason },
        )
        .await
    }

    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        let (frame_tx, port_tx) = self.channels()?;
        send_frame(
            &frame_tx,
            &port_tx,
            &self.ctx.tab_id,
            TabMessage::TabSend {
                data: payload.into(),
            },
        )
        .await
    }

    /// Register a callback locally and announce it to the host; the host
    /// immediately replays its cached last envelope for the type, if any.
    pub async fn register_callback(&self, entry: CallbackEntry) -> Result<String> {
        let message_type = entry.message_type.clone();
        let id = self.registry.lock().unwrap().register(entry)?;
        let (frame_tx, port_tx) = self.channels()?;
        send_frame(
            &frame_tx,
            &port_tx,
            &self.ctx.tab_id,
            TabMessage::TabRegisterCallback {
                message_type,
                callback_id: id.clone(),
            },
        )
        .await?;
        Ok(id)
    }

    /// Register a callback under a caller-chosen id (used by the facade to
    /// replay callbacks staged before start).
    pub async fn register_callback_as(&self, entry: CallbackEntry, id: String) -> Result<()> {
        let message_type = entry.message_type.clone();
        self.registry
            .lock()
            .unwrap()
            .register_with_id(entry, id.clone())?;
        let (frame_tx, port_tx) = self.channels()?;
        send_frame(
            &frame_tx,
            &port_tx,
            &self.ctx.tab_id,
            TabMessage::TabRegisterCallback {
                message_type,
                callback_id: id,
            },
        )
        .await
    }

    /// Remove every callback, locally and host-side.
    pub async fn clear_callbacks(&self) -> Result<()> {
        let pairs = {
            let mut registry = self.registry.lock().unwrap();
            let pairs = registry.snapshot();
            registry.clear();
            pairs
        };
        let (frame_tx, port_tx) = self.channels()?;
        for (message_type, callback_id) in pairs {
            send_frame(
                &frame_tx,
                &port_tx,
                &self.ctx.tab_id,
                TabMessage::TabUnregisterCallback {
                    message_type,
                    callback_id: Some(callback_id),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Remove one callback (or all for the type) locally and host-side.
    pub async fn unregister_callback(
        &self,
        message_type: &str,
        callback_id: Option<&str>,
    ) -> Result<()> {
        self.registry
            .lock()
            .unwrap()
            .unregister(message_type, callback_id);
        let (frame_tx, port_tx) = self.channels()?;
        send_frame(
            &frame_tx,
            &port_tx,
            &self.ctx.tab_id,
            TabMessage::TabUnregisterCallback {
                message_type: message_type.to_string(),
                callback_id: callback_id.map(String::from),
            },
        )
        .await
    }

    /// Report a visibility transition for this session.
    pub async fn set_visible(&self, visible: bool) -> Result<()> {
        let (frame_tx, port_tx) = self.channels()?;
        self.ctx.visible.store(visible, Ordering::SeqCst);
        if visible && !self.is_connected() {
            // The host may have reaped this tab while it was hidden.
            reinit(&frame_tx, &port_tx, &self.ctx, &self.registry).await;
        }
        send_frame(
            &frame_tx,
            &port_tx,
            &self.ctx.tab_id,
            TabMessage::TabVisibility { is_visible: visible },
        )
        .await
    }

    /// Report that the machine came back online.
    pub async fn notify_network_online(&self) -> Result<()> {
        let (frame_tx, port_tx) = self.channels()?;
        send_frame(
            &frame_tx,
            &port_tx,
            &self.ctx.tab_id,
            TabMessage::TabNetworkOnline,
        )
        .await
    }

    fn channels(&self) -> Result<(mpsc::Sender<PortFrame>, mpsc::Sender<HostMessage>)> {
        match (&self.frame_tx, &self.port_tx) {
            (Some(frame_tx), Some(port_tx)) => Ok((frame_tx.clone(), port_tx.clone())),
            _ => Err(Error::Transport("shared client is not started".to_string())),
        }
    }

    fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.frame_tx = None;
        self.port_tx = None;
        self.connected.store(false, Ordering::SeqCst);
        self.stopped = true;
    }
}

impl Drop for SharedClient {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        // Best-effort detach so the host does not wait for the stale sweep.
        if let (Some(frame_tx), Some(port_tx)) = (&self.frame_tx, &self.port_tx) {
            let _ = frame_tx.try_send(PortFrame {
                frame: TabFrame::new(&self.ctx.tab_id, TabMessage::TabDisconnect),
                port: port_tx.clone(),
            });
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn send_frame(
    frame_tx: &mpsc::Sender<PortFrame>,
    port_tx: &mpsc::Sender<HostMessage>,
    tab_id: &str,
    message: TabMessage,
) -> Result<()> {
    frame_tx
        .send(PortFrame {
            frame: TabFrame::new(tab_id, message),
            port: port_tx.clone(),
        })
        .await
        .map_err(|_| Error::Transport("shared host is gone".to_string()))
}

/// Re-announce this tab and all of its subscriptions.
async fn reinit(
    frame_tx: &mpsc::Sender<PortFrame>,
    port_tx: &mpsc::Sender<HostMessage>,
    ctx: &InitContext,
    registry: &StdMutex<CallbackRegistry>,
) {
    debug!(tab_id = %ctx.tab_id, "reinitializing with shared host");
    let _ = send_frame(frame_tx, port_tx, &ctx.tab_id, ctx.init_message()).await;
    let pairs = registry.lock().unwrap().snapshot();
    for (message_type, callback_id) in pairs {
        let _ = send_frame(
            frame_tx,
            port_tx,
            &ctx.tab_id,
            TabMessage::TabRegisterCallback {
                message_type,
                callback_id,
            },
        )
        .await;
    }
}

async fn port_pump(
    mut port_rx: mpsc::Receiver<HostMessage>,
    ctx: Arc<InitContext>,
    registry: Arc<StdMutex<CallbackRegistry>>,
    connected: Arc<AtomicBool>,
    hooks: SharedHooks,
    frame_tx: mpsc::Sender<PortFrame>,
    port_tx: mpsc::Sender<HostMessage>,
) {
    while let Some(message) = port_rx.recv().await {
        match message {
            HostMessage::WorkerReady => {
                debug!(tab_id = %ctx.tab_id, "host acknowledged registration");
            }
            HostMessage::WorkerConnected => {
                connected.store(true, Ordering::SeqCst);
                if let Some(hook) = &hooks.on_connected {
                    hook();
                }
            }
            HostMessage::WorkerDisconnected => {
                // Reconnection is the host's responsibility; local state stays.
                connected.store(false, Ordering::SeqCst);
                if let Some(hook) = &hooks.on_disconnected {
                    hook();
                }
            }
            HostMessage::WorkerMessage { envelope, .. } => {
                let callbacks = registry
                    .lock()
                    .unwrap()
                    .callbacks_for(&envelope.message_type);
                fan_out(&callbacks, &envelope);
            }
            HostMessage::WorkerError { message, .. } => {
                warn!(tab_id = %ctx.tab_id, error = %message, "host reported an error");
                if let Some(hook) = &hooks.on_error {
                    hook(&message);
                }
            }
            HostMessage::WorkerAuthConflict {
                current_user_id,
                new_user_id,
                ..
            } => {
                if let Some(hook) = &hooks.on_auth_conflict {
                    hook(&current_user_id, &new_user_id);
                }
            }
            HostMessage::WorkerPong => {
                debug!(tab_id = %ctx.tab_id, "pong");
            }
            HostMessage::WorkerTabNotFound => {
                reinit(&frame_tx, &port_tx, &ctx, &registry).await;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

async fn liveness_pump(
    ctx: Arc<InitContext>,
    frame_tx: mpsc::Sender<PortFrame>,
    port_tx: mpsc::Sender<HostMessage>,
) {
    let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if send_frame(&frame_tx, &port_tx, &ctx.tab_id, TabMessage::TabPing)
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn visibility_pump(
    mut rx: watch::Receiver<bool>,
    ctx: Arc<InitContext>,
    registry: Arc<StdMutex<CallbackRegistry>>,
    connected: Arc<AtomicBool>,
    frame_tx: mpsc::Sender<PortFrame>,
    port_tx: mpsc::Sender<HostMessage>,
) {
    while rx.changed().await.is_ok() {
        let visible = *rx.borrow();
        ctx.visible.store(visible, Ordering::SeqCst);
        if visible && !connected.load(Ordering::SeqCst) {
            reinit(&frame_tx, &port_tx, &ctx, &registry).await;
        }
        if send_frame(
            &frame_tx,
            &port_tx,
            &ctx.tab_id,
            TabMessage::TabVisibility { is_visible: visible },
        )
        .await
        .is_err()
        {
            return;
        }
    }
}

async fn network_pump(
    mut rx: watch::Receiver<bool>,
    ctx: Arc<InitContext>,
    frame_tx: mpsc::Sender<PortFrame>,
    port_tx: mpsc::Sender<HostMessage>,
) {
    while rx.changed().await.is_ok() {
        if *rx.borrow()
            && send_frame(&frame_tx, &port_tx, &ctx.tab_id, TabMessage::TabNetworkOnline)
                .await
                .is_err()
        {
            return;
        }
    }
}
