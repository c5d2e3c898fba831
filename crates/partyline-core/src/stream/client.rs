//! StreamClient: one authenticated text-stream session with heartbeat,
//! bounded reconnection, network awareness, and per-type fan-out.
//!
//! The public handle is cheap to clone; a background task owns the
//! WebSocket. Each live connection gets its own reader pump tagged with a
//! generation counter so events from a torn-down connection are ignored.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::stream::backoff::ReconnectPolicy;
use crate::stream::dispatch::{fan_out, CallbackEntry, CallbackRegistry};
use crate::types::{parse_envelope, Envelope, Payload};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant as TokioInstant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Effectively "never" for inactive sleep branches.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// Stream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Disconnected = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
}

impl ReadyState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReadyState::Connecting,
            2 => ReadyState::Open,
            3 => ReadyState::Closing,
            _ => ReadyState::Disconnected,
        }
    }

    pub fn as_int(&self) -> u8 {
        *self as u8
    }
}

/// Lifecycle hooks set by the owner (facade or shared host).
///
/// `on_close` fires only for unexpected closes; a manual `disconnect()` is
/// silent. `on_envelope` sees every valid inbound envelope along with its
/// raw frame, before per-type callbacks run.
#[derive(Clone, Default)]
pub struct StreamHooks {
    pub on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(Option<u16>, Duration) + Send + Sync>>,
    /// A connect attempt failed before the stream ever opened.
    pub on_connect_failed: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_envelope: Option<Arc<dyn Fn(&str, &Envelope) + Send + Sync>>,
}

enum StreamCmd {
    Connect(Option<String>),
    Disconnect,
    Send(Payload),
}

enum WsEvent {
    Frame(String),
    Ping(Vec<u8>),
    Closed { code: Option<u16> },
    Failed(String),
}

/// Handle to a single reconnecting stream session.
#[derive(Clone)]
pub struct StreamClient {
    cmd_tx: mpsc::UnboundedSender<StreamCmd>,
    state: Arc<AtomicU8>,
    registry: Arc<StdMutex<CallbackRegistry>>,
}

impl StreamClient {
    /// Create the client and spawn its background task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: ClientConfig, hooks: StreamHooks) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ReadyState::Disconnected.as_int()));
        let registry = Arc::new(StdMutex::new(CallbackRegistry::new()));

        tokio::spawn(stream_task(
            cmd_rx,
            config,
            hooks,
            Arc::clone(&state),
            Arc::clone(&registry),
        ));

        Self {
            cmd_tx,
            state,
            registry,
        }
    }

    /// Open the stream against the configured URL. Idempotent while the
    /// stream is OPEN or CONNECTING.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(StreamCmd::Connect(None));
    }

    /// Open the stream against an explicit URL, replacing the configured one.
    pub fn connect_url(&self, url: impl Into<String>) {
        let _ = self.cmd_tx.send(StreamCmd::Connect(Some(url.into())));
    }

    /// Close the stream, cancel the heartbeat and any pending reconnect.
    /// Subscriptions are kept.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(StreamCmd::Disconnect);
    }

    /// Send a payload. Fails with [`Error::SendUnavailable`] when the stream
    /// is not OPEN; the payload is dropped.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        if !self.is_open() {
            warn!("send unavailable: stream is not open, payload dropped");
            return Err(Error::SendUnavailable);
        }
        self.cmd_tx
            .send(StreamCmd::Send(payload.into()))
            .map_err(|_| Error::Transport("stream task is gone".to_string()))
    }

    /// Register a subscription; returns its callback id, or `None` for an
    /// invalid entry (logged at warn, no state change).
    pub fn on(&self, entry: CallbackEntry) -> Option<String> {
        let result = self.registry.lock().unwrap().register(entry);
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "subscription rejected");
                None
            }
        }
    }

    /// Register a subscription under a caller-chosen id (used by owners
    /// that announced the id elsewhere before the stream existed).
    pub fn on_with_id(&self, entry: CallbackEntry, id: String) -> Option<String> {
        let result = self.registry.lock().unwrap().register_with_id(entry, id);
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "subscription rejected");
                None
            }
        }
    }

    /// Remove one callback, or every callback for a type when `id` is None.
    pub fn off(&self, message_type: &str, id: Option<&str>) {
        self.registry.lock().unwrap().unregister(message_type, id);
    }

    /// Remove all subscriptions.
    pub fn clear_subscriptions(&self) {
        self.registry.lock().unwrap().clear();
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Reader half of one connection: forwards frames into the task loop,
/// tagged with the connection generation.
async fn read_pump(
    gen: u64,
    mut source: SplitStream<WsStream>,
    evt_tx: mpsc::UnboundedSender<(u64, WsEvent)>,
) {
    while let Some(frame) = source.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => WsEvent::Frame(text),
            Ok(Message::Ping(payload)) => WsEvent::Ping(payload),
            Ok(Message::Close(frame)) => {
                let code = frame.map(|f| u16::from(f.code));
                let _ = evt_tx.send((gen, WsEvent::Closed { code }));
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = evt_tx.send((gen, WsEvent::Failed(e.to_string())));
                return;
            }
        };
        if evt_tx.send((gen, event)).is_err() {
            return;
        }
    }
    let _ = evt_tx.send((gen, WsEvent::Closed { code: None }));
}

struct TaskState {
    config: ClientConfig,
    hooks: StreamHooks,
    state: Arc<AtomicU8>,
    registry: Arc<StdMutex<CallbackRegistry>>,
    policy: ReconnectPolicy,
    evt_tx: mpsc::UnboundedSender<(u64, WsEvent)>,

    writer: Option<WsSink>,
    gen: u64,
    target_url: Option<String>,
    manual_close: bool,
    attempts: u32,
    reconnect_at: Option<TokioInstant>,
    opened_at: Instant,
}

impl TaskState {
    fn set_state(&self, s: ReadyState) {
        self.state.store(s.as_int(), Ordering::SeqCst);
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn heartbeat_envelope(&self) -> Envelope {
        match &self.config.heartbeat_message {
            Some(factory) => factory(),
            None => Envelope::ping(),
        }
    }

    /// Attempt to open the stream now. Returns whether it opened.
    async fn try_open(&mut self, heartbeat: &mut tokio::time::Interval) -> bool {
        let Some(url) = self.target_url.clone() else {
            warn!("connect requested without a stream url");
            self.set_state(ReadyState::Disconnected);
            return false;
        };

        self.set_state(ReadyState::Connecting);
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                let (sink, source) = stream.split();
                self.gen += 1;
                tokio::spawn(read_pump(self.gen, source, self.evt_tx.clone()));
                self.writer = Some(sink);
                self.attempts = 0;
                self.opened_at = Instant::now();
                self.set_state(ReadyState::Open);
                heartbeat.reset();
                info!(url = %url, "stream open");
                if let Some(hook) = &self.hooks.on_open {
                    hook();
                }
                true
            }
            Err(e) => {
                self.set_state(ReadyState::Disconnected);
                let message = e.to_string();
                warn!(url = %url, error = %message, "stream connect failed");
                if let Some(hook) = &self.hooks.on_error {
                    hook(&message);
                }
                if let Some(hook) = &self.hooks.on_connect_failed {
                    hook(&message);
                }
                self.schedule_reconnect();
                false
            }
        }
    }

    /// Tear down after an unexpected close and schedule a reconnect.
    fn transport_down(&mut self, code: Option<u16>) {
        self.writer = None;
        self.gen += 1;
        self.set_state(ReadyState::Disconnected);
        let elapsed = self.opened_at.elapsed();
        debug!(?code, elapsed_ms = elapsed.as_millis() as u64, "stream closed");
        if let Some(hook) = &self.hooks.on_close {
            hook(code, elapsed);
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.manual_close {
            return;
        }
        self.attempts += 1;
        match self.policy.delay_for(self.attempts) {
            Some(delay) => {
                info!(
                    attempt = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.reconnect_at = Some(TokioInstant::now() + delay);
            }
            None => {
                if self.policy.auto_reconnect {
                    warn!(
                        attempts = self.attempts - 1,
                        "reconnect attempts exhausted; waiting for a fresh trigger"
                    );
                }
                self.reconnect_at = None;
            }
        }
    }

    fn dispatch_frame(&self, text: &str) {
        let envelope = match parse_envelope(text) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "malformed inbound frame dropped");
                return;
            }
        };
        if let Some(hook) = &self.hooks.on_envelope {
            hook(text, &envelope);
        }
        let callbacks = self
            .registry
            .lock()
            .unwrap()
            .callbacks_for(&envelope.message_type);
        fan_out(&callbacks, &envelope);
    }
}

async fn stream_task(
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCmd>,
    config: ClientConfig,
    hooks: StreamHooks,
    state: Arc<AtomicU8>,
    registry: Arc<StdMutex<CallbackRegistry>>,
) {
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
    let policy = ReconnectPolicy::from_config(&config);
    let mut net_rx = if config.enable_network_listener {
        config.network.clone()
    } else {
        None
    };

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ts = TaskState {
        target_url: config.url.clone(),
        config,
        hooks,
        state,
        registry,
        policy,
        evt_tx,
        writer: None,
        gen: 0,
        manual_close: false,
        attempts: 0,
        reconnect_at: None,
        opened_at: Instant::now(),
    };

    loop {
        let reconnect_sleep = tokio::time::sleep_until(
            ts.reconnect_at
                .unwrap_or_else(|| TokioInstant::now() + FAR_FUTURE),
        );
        tokio::pin!(reconnect_sleep);

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(StreamCmd::Connect(url)) => {
                    if let Some(url) = url {
                        ts.target_url = Some(url);
                    }
                    ts.manual_close = false;
                    if matches!(ts.ready_state(), ReadyState::Open | ReadyState::Connecting) {
                        continue;
                    }
                    ts.reconnect_at = None;
                    ts.attempts = 0;
                    ts.try_open(&mut heartbeat).await;
                }
                Some(StreamCmd::Disconnect) => {
                    ts.manual_close = true;
                    ts.reconnect_at = None;
                    ts.attempts = 0;
                    if let Some(mut sink) = ts.writer.take() {
                        ts.set_state(ReadyState::Closing);
                        let _ = sink.close().await;
                        ts.gen += 1;
                    }
                    ts.set_state(ReadyState::Disconnected);
                }
                Some(StreamCmd::Send(payload)) => {
                    let Some(sink) = ts.writer.as_mut() else {
                        warn!("send unavailable: stream is not open, payload dropped");
                        continue;
                    };
                    match payload.into_text() {
                        Ok(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                let message = e.to_string();
                                warn!(error = %message, "send failed; treating stream as down");
                                if let Some(hook) = &ts.hooks.on_error {
                                    hook(&message);
                                }
                                ts.transport_down(None);
                            }
                        }
                        Err(e) => warn!(error = %e, "unserializable payload dropped"),
                    }
                }
                None => {
                    if let Some(mut sink) = ts.writer.take() {
                        let _ = sink.close().await;
                    }
                    ts.set_state(ReadyState::Disconnected);
                    return;
                }
            },

            event = evt_rx.recv() => {
                let Some((gen, event)) = event else { return };
                if gen != ts.gen {
                    continue;
                }
                match event {
                    WsEvent::Frame(text) => ts.dispatch_frame(&text),
                    WsEvent::Ping(payload) => {
                        if let Some(sink) = ts.writer.as_mut() {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                    }
                    WsEvent::Closed { code } => ts.transport_down(code),
                    WsEvent::Failed(message) => {
                        tracing::error!(error = %message, "stream transport error");
                        if let Some(hook) = &ts.hooks.on_error {
                            hook(&message);
                        }
                        ts.transport_down(None);
                    }
                }
            },

            _ = heartbeat.tick(), if ts.writer.is_some() => {
                if ts.ready_state() != ReadyState::Open {
                    continue;
                }
                let envelope = ts.heartbeat_envelope();
                match serde_json::to_string(&envelope) {
                    Ok(text) => {
                        if let Some(sink) = ts.writer.as_mut() {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                warn!(error = %e, "heartbeat send failed");
                                ts.transport_down(None);
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "heartbeat envelope did not serialize"),
                }
            },

            _ = &mut reconnect_sleep, if ts.reconnect_at.is_some() => {
                ts.reconnect_at = None;
                if !ts.manual_close {
                    ts.try_open(&mut heartbeat).await;
                }
            },

            changed = async { net_rx.as_mut().expect("guarded by branch").changed().await },
                if net_rx.is_some() =>
            {
                match changed {
                    Ok(()) => {
                        let online = *net_rx.as_ref().expect("guarded by branch").borrow();
                        if !online {
                            if ts.reconnect_at.take().is_some() {
                                debug!("offline: pending reconnect cancelled");
                            }
                        } else {
                            ts.attempts = 0;
                            ts.reconnect_at = None;
                            if ts.writer.is_none() && !ts.manual_close && ts.target_url.is_some() {
                                debug!("online: reconnecting immediately");
                                ts.try_open(&mut heartbeat).await;
                            }
                        }
                    }
                    Err(_) => net_rx = None,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(url: String) -> ClientConfig {
        ClientConfig {
            url: Some(url),
            auto_reconnect: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_unavailable_when_not_open() {
        let client = StreamClient::new(test_config("ws://127.0.0.1:1".into()), StreamHooks::default());
        assert!(matches!(client.send("x"), Err(Error::SendUnavailable)));
        assert_eq!(client.ready_state(), ReadyState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_subscription_is_rejected() {
        let client = StreamClient::new(test_config("ws://127.0.0.1:1".into()), StreamHooks::default());
        assert!(client.on(CallbackEntry::new("", |_, _| {})).is_none());
        assert!(client.on(CallbackEntry::new("EVT", |_, _| {})).is_some());
    }

    #[tokio::test]
    async fn test_connect_failure_stays_disconnected() {
        let client = StreamClient::new(test_config("ws://127.0.0.1:1".into()), StreamHooks::default());
        client.connect();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!client.is_open());
        assert_eq!(client.ready_state(), ReadyState::Disconnected);
    }

    #[tokio::test]
    async fn test_round_trip_with_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"UNREAD","data":{"n":7}}"#.into()))
                .await
                .unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
        });

        let client = StreamClient::new(test_config(format!("ws://{}", addr)), StreamHooks::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on(CallbackEntry::new("UNREAD", move |data, _env| {
            let _ = tx.send(data.clone());
        }));
        client.connect();

        let data = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(data, json!({"n": 7}));
        assert!(client.is_open());

        client.send("hello").unwrap();
        let echoed = timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(echoed, "hello");

        client.disconnect();
    }

    #[tokio::test]
    async fn test_heartbeat_envelope_reaches_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
        });

        let config = ClientConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..test_config(format!("ws://{}", addr))
        };
        let client = StreamClient::new(config, StreamHooks::default());
        client.connect();

        let text = timeout(WAIT, server).await.unwrap().unwrap();
        let envelope = parse_envelope(&text).unwrap().unwrap();
        assert_eq!(envelope.message_type, "PING");
        assert!(envelope.timestamp.is_some());

        client.disconnect();
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let opened = Arc::new(StdMutex::new(0u32));
        let opened_clone = opened.clone();

        let server = tokio::spawn(async move {
            // First connection: accept, then drop immediately.
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
            // Second connection: keep it alive until the test ends.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let config = ClientConfig {
            auto_reconnect: true,
            reconnect_delay: Duration::from_millis(50),
            reconnect_delay_max: Duration::from_millis(100),
            max_reconnect_attempts: 5,
            ..test_config(format!("ws://{}", addr))
        };
        let hooks = StreamHooks {
            on_open: Some(Arc::new(move || {
                *opened_clone.lock().unwrap() += 1;
            })),
            ..Default::default()
        };
        let client = StreamClient::new(config, hooks);
        client.connect();

        timeout(WAIT, async {
            loop {
                if *opened.lock().unwrap() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(client.is_open());
        client.disconnect();
        server.abort();
    }
}
