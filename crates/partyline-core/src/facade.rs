//! Facade: one uniform entry point over the shared, visibility, and direct
//! connection strategies.
//!
//! Owns the configuration and the current session identity, picks a mode
//! from injectable capability probes, degrades gracefully when a strategy
//! is unavailable, and replays callbacks staged before `start`.

use crate::config::{ClientConfig, ConfigPatch, ConnectionMode};
use crate::error::{Error, Result};
use crate::shared::registry;
use crate::shared::{SharedClient, SharedClientOptions, SharedHooks, DEFAULT_HOST_NAME};
use crate::stream::{CallbackEntry, StreamClient, StreamHooks};
use crate::types::{Payload, SessionIdentity};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Effectively "never" for inactive sleep branches.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// Identity supplied to [`Facade::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub user_id: String,
    pub credential: String,
}

/// Capability probes and host naming, injectable for tests.
#[derive(Clone)]
pub struct FacadeOptions {
    /// Well-known name every facade session attaches under.
    pub host_name: String,
    /// Whether the shared strategy is available here.
    pub shared_probe: Arc<dyn Fn() -> bool + Send + Sync>,
    /// Whether the visibility strategy is available for this config.
    pub visibility_probe: Arc<dyn Fn(&ClientConfig) -> bool + Send + Sync>,
}

impl Default for FacadeOptions {
    fn default() -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_string(),
            shared_probe: Arc::new(registry::host_supported),
            visibility_probe: Arc::new(|config: &ClientConfig| config.visibility.is_some()),
        }
    }
}

/// Deterministic mode selection with the degradation ladder
/// shared → visibility → direct.
fn select_mode(
    requested: ConnectionMode,
    shared_ok: bool,
    visibility_ok: bool,
    visibility_management: bool,
) -> ConnectionMode {
    let auto_visibility = visibility_ok && visibility_management;
    match requested {
        ConnectionMode::Auto | ConnectionMode::Shared => {
            if shared_ok {
                ConnectionMode::Shared
            } else if auto_visibility {
                ConnectionMode::Visibility
            } else {
                ConnectionMode::Direct
            }
        }
        ConnectionMode::Visibility => {
            if visibility_ok {
                ConnectionMode::Visibility
            } else {
                ConnectionMode::Direct
            }
        }
        ConnectionMode::Direct => ConnectionMode::Direct,
    }
}

struct StagedCallback {
    id: String,
    entry: CallbackEntry,
}

enum Active {
    Direct { stream: StreamClient },
    Visibility { stream: StreamClient, driver: JoinHandle<()> },
    Shared { client: SharedClient },
}

impl Active {
    fn mode(&self) -> ConnectionMode {
        match self {
            Active::Direct { .. } => ConnectionMode::Direct,
            Active::Visibility { .. } => ConnectionMode::Visibility,
            Active::Shared { .. } => ConnectionMode::Shared,
        }
    }
}

struct FacadeInner {
    config: ClientConfig,
    hooks: SharedHooks,
    staged: Vec<StagedCallback>,
    identity: Option<SessionIdentity>,
    active: Option<Active>,
}

/// The process-facing handle. One instance per session; hold it in a
/// `static` if the singleton form is wanted.
pub struct Facade {
    options: FacadeOptions,
    inner: Mutex<FacadeInner>,
}

impl Default for Facade {
    fn default() -> Self {
        Self::new()
    }
}

impl Facade {
    pub fn new() -> Self {
        Self::with_options(FacadeOptions::default())
    }

    pub fn with_options(options: FacadeOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(FacadeInner {
                config: ClientConfig::default(),
                hooks: SharedHooks::default(),
                staged: Vec::new(),
                identity: None,
                active: None,
            }),
        }
    }

    /// Merge a partial configuration. Takes effect on the next `start`.
    pub async fn set_config(&self, patch: ConfigPatch) {
        patch.apply_to(&mut self.inner.lock().await.config);
    }

    /// Install lifecycle hooks. Takes effect on the next `start`.
    pub async fn set_hooks(&self, hooks: SharedHooks) {
        self.inner.lock().await.hooks = hooks;
    }

    /// Replace the staged callback set; forwarded immediately when started.
    pub async fn set_callbacks(&self, entries: Vec<CallbackEntry>) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let mut staged = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.message_type.is_empty() {
                warn!("subscription rejected: message type must be non-empty");
                continue;
            }
            staged.push(StagedCallback {
                id: Uuid::new_v4().to_string(),
                entry,
            });
        }
        inner.staged = staged;
        match &inner.active {
            Some(Active::Direct { stream }) | Some(Active::Visibility { stream, .. }) => {
                stream.clear_subscriptions();
            }
            Some(Active::Shared { client }) => client.clear_callbacks().await?,
            None => {}
        }
        self.replay_staged(&mut inner).await?;
        Ok(inner.staged.iter().map(|s| s.id.clone()).collect())
    }

    /// Stage (and, when started, forward) a single callback.
    pub async fn register_callback(&self, entry: CallbackEntry) -> Result<String> {
        if entry.message_type.is_empty() {
            warn!("subscription rejected: message type must be non-empty");
            return Err(Error::InvalidSubscription(
                "message type must be non-empty".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let id = Uuid::new_v4().to_string();
        match &inner.active {
            Some(Active::Direct { stream }) | Some(Active::Visibility { stream, .. }) => {
                stream.on_with_id(entry.clone(), id.clone());
            }
            Some(Active::Shared { client }) => {
                client.register_callback_as(entry.clone(), id.clone()).await?;
            }
            None => {}
        }
        inner.staged.push(StagedCallback { id: id.clone(), entry });
        Ok(id)
    }

    /// Remove one callback (or all for a type) from the staged set and the
    /// live connection.
    pub async fn unregister_callback(&self, message_type: &str, id: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.staged.retain(|s| {
            s.entry.message_type != message_type || id.map_or(false, |id| s.id != id)
        });
        match &inner.active {
            Some(Active::Direct { stream }) | Some(Active::Visibility { stream, .. }) => {
                stream.off(message_type, id);
                Ok(())
            }
            Some(Active::Shared { client }) => client.unregister_callback(message_type, id).await,
            None => Ok(()),
        }
    }

    /// Select a mode and stand up the connection for the given identity.
    ///
    /// A second start with an unchanged identity while a connection exists
    /// is a no-op (unless `force_new_on_start` is set). A changed identity
    /// tears the previous connection down first.
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let Some(url) = inner.config.url.clone() else {
            error!("start requires a configured url");
            return Err(Error::Config("start requires a configured url".to_string()));
        };
        if options.user_id.is_empty() || options.credential.is_empty() {
            error!("start requires a user id and credential");
            return Err(Error::Config(
                "start requires a user id and credential".to_string(),
            ));
        }
        let identity = SessionIdentity::new(url, options.user_id, options.credential);

        if !inner.config.force_new_on_start
            && inner.active.is_some()
            && inner.identity.as_ref() == Some(&identity)
        {
            debug!("start with unchanged identity; keeping the existing connection");
            return Ok(());
        }

        teardown(&mut inner).await;
        inner.identity = Some(identity.clone());

        let shared_ok = (self.options.shared_probe)();
        let visibility_ok = (self.options.visibility_probe)(&inner.config);
        let requested = inner.config.connection_mode;
        let resolved = select_mode(
            requested,
            shared_ok,
            visibility_ok,
            inner.config.enable_visibility_management,
        );
        if requested != ConnectionMode::Auto && resolved != requested {
            warn!(
                requested = requested.as_str(),
                resolved = resolved.as_str(),
                "requested connection mode unavailable; degrading"
            );
        }

        let resolved = match resolved {
            ConnectionMode::Shared => match self.start_shared(&mut inner, &identity).await {
                Ok(()) => ConnectionMode::Shared,
                Err(e) => {
                    // One-way degradation for the rest of this start cycle.
                    warn!(error = %e, "shared host attach failed; degrading");
                    let fallback = if visibility_ok && inner.config.enable_visibility_management {
                        ConnectionMode::Visibility
                    } else {
                        ConnectionMode::Direct
                    };
                    self.start_stream(
                        &mut inner,
                        &identity,
                        fallback == ConnectionMode::Visibility,
                    )?;
                    fallback
                }
            },
            ConnectionMode::Visibility => {
                self.start_stream(&mut inner, &identity, true)?;
                ConnectionMode::Visibility
            }
            _ => {
                self.start_stream(&mut inner, &identity, false)?;
                ConnectionMode::Direct
            }
        };

        info!(
            mode = resolved.as_str(),
            user_id = %identity.user_id,
            "session started"
        );
        Ok(())
    }

    /// Tear down this session's connection. In shared mode other sessions
    /// keep the upstream.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        teardown(&mut inner).await;
    }

    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        let inner = self.inner.lock().await;
        match &inner.active {
            Some(Active::Direct { stream }) | Some(Active::Visibility { stream, .. }) => {
                stream.send(payload)
            }
            Some(Active::Shared { client }) => client.send(payload).await,
            None => {
                warn!("send unavailable: no active connection");
                Err(Error::SendUnavailable)
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        let inner = self.inner.lock().await;
        match &inner.active {
            Some(Active::Direct { stream }) | Some(Active::Visibility { stream, .. }) => {
                stream.is_open()
            }
            Some(Active::Shared { client }) => client.is_connected(),
            None => false,
        }
    }

    pub async fn current_mode(&self) -> Option<ConnectionMode> {
        self.inner.lock().await.active.as_ref().map(Active::mode)
    }

    pub async fn current_user_id(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.identity.as_ref().map(|i| i.user_id.clone())
    }

    pub async fn current_credential(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.identity.as_ref().map(|i| i.credential.clone())
    }

    async fn start_shared(
        &self,
        inner: &mut FacadeInner,
        identity: &SessionIdentity,
    ) -> Result<()> {
        let mut options =
            SharedClientOptions::new(identity.clone(), inner.config.clone());
        options.host_name = self.options.host_name.clone();
        let mut client = SharedClient::new(options, inner.hooks.clone());
        client.start().await?;
        for staged in &inner.staged {
            client
                .register_callback_as(staged.entry.clone(), staged.id.clone())
                .await?;
        }
        inner.active = Some(Active::Shared { client });
        Ok(())
    }

    fn start_stream(
        &self,
        inner: &mut FacadeInner,
        identity: &SessionIdentity,
        visibility_scoped: bool,
    ) -> Result<()> {
        let stream_url = identity.stream_url()?;
        let mut config = inner.config.clone();
        config.url = Some(stream_url);

        let stream = StreamClient::new(config.clone(), stream_hooks(inner.hooks.clone()));
        for staged in &inner.staged {
            stream.on_with_id(staged.entry.clone(), staged.id.clone());
        }

        if visibility_scoped {
            let rx = config
                .visibility
                .clone()
                .ok_or_else(|| Error::Config("visibility mode needs a visibility feed".to_string()))?;
            if *rx.borrow() {
                stream.connect();
            }
            let driver = tokio::spawn(visibility_driver(
                rx,
                stream.clone(),
                config.shared_idle_timeout,
            ));
            inner.active = Some(Active::Visibility { stream, driver });
        } else {
            stream.connect();
            inner.active = Some(Active::Direct { stream });
        }
        Ok(())
    }

    async fn replay_staged(&self, inner: &mut FacadeInner) -> Result<()> {
        match &inner.active {
            Some(Active::Direct { stream }) | Some(Active::Visibility { stream, .. }) => {
                for staged in &inner.staged {
                    stream.on_with_id(staged.entry.clone(), staged.id.clone());
                }
                Ok(())
            }
            Some(Active::Shared { client }) => {
                for staged in &inner.staged {
                    client
                        .register_callback_as(staged.entry.clone(), staged.id.clone())
                        .await?;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

async fn teardown(inner: &mut FacadeInner) {
    match inner.active.take() {
        Some(Active::Direct { stream }) => stream.disconnect(),
        Some(Active::Visibility { stream, driver }) => {
            driver.abort();
            stream.disconnect();
        }
        Some(Active::Shared { mut client }) => client.stop().await,
        None => {}
    }
}

/// Map facade lifecycle hooks onto the raw stream hooks for direct and
/// visibility modes.
fn stream_hooks(hooks: SharedHooks) -> StreamHooks {
    StreamHooks {
        on_open: hooks.on_connected.clone(),
        on_close: hooks.on_disconnected.clone().map(|hook| {
            Arc::new(move |_code: Option<u16>, _elapsed: Duration| hook())
                as Arc<dyn Fn(Option<u16>, Duration) + Send + Sync>
        }),
        on_connect_failed: None,
        on_error: hooks.on_error,
        on_envelope: None,
    }
}

/// Drives a visibility-scoped stream: hidden arms an idle countdown before
/// disconnecting; visible cancels it and connects.
async fn visibility_driver(
    mut rx: watch::Receiver<bool>,
    stream: StreamClient,
    idle_timeout: Duration,
) {
    let mut deadline: Option<TokioInstant> = None;
    loop {
        let idle_sleep = tokio::time::sleep_until(
            deadline.unwrap_or_else(|| TokioInstant::now() + FAR_FUTURE),
        );
        tokio::pin!(idle_sleep);

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let visible = *rx.borrow();
                if visible {
                    deadline = None;
                    stream.connect();
                } else {
                    deadline = Some(TokioInstant::now() + idle_timeout);
                }
            }
            _ = &mut idle_sleep, if deadline.is_some() => {
                deadline = None;
                debug!("hidden past the idle window; disconnecting");
                stream.disconnect();
            }
        }
    }
}
