//! Websocket transport to the coordinator.
//!
//! A [`Client`] keeps one logical connection alive across socket failures.
//! The connection loop runs as a single tokio task; each session inside it
//! drives a producer (outgoing queue to socket) and a consumer (socket to
//! subscribers) until one of them fails or shutdown is requested.
//!
//! Sequence numbers:
//! - outgoing numbers start at 1 and are never reset on reconnect
//! - a frame dequeued but not written when the socket fails is kept in an
//!   in-flight slot and written first after reconnecting, with its number
//! - inbound numbers are classified against the last number seen
//!   (see [`crate::codec::classify`]) and every inbound message is acked
//!   before it is dispatched
//!
//! Inbound `ack` frames answer our own messages; they are logged and not
//! acknowledged again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::bridge::BridgeQueue;
use crate::codec::{self, AckTracker, MessageType};
use crate::diagnostic::{Diagnostic, FatalHandler, exit_process};
use crate::error::{Error, Result, TransportError};
use crate::retry::{ReconnectPolicy, UrlRotation};
use crate::settings::Settings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Title of the diagnostic shown when the retry limit is exhausted.
pub const GIVE_UP_TITLE: &str = "COULD NOT CONNECT:";
const GIVE_UP_BODY: &str = "Unable to connect to server, giving up.\nPlease try again and contact support if the error persists.";

/// Receives every dispatched inbound message.
///
/// A returned `(type, payload)` is sent back to the coordinator.
pub trait Subscriber: Send + Sync {
    fn on_server_message(
        &self,
        message_type: MessageType,
        payload: &Value,
    ) -> Result<Option<(MessageType, Value)>>;
}

/// The message transport the scheduler runs on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Number and enqueue a message. Never blocks.
    fn send(&self, message_type: MessageType, payload: Value) -> Result<()>;

    /// Register a subscriber. Subscribers are called in registration order.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber>);

    /// Start connecting in the background.
    async fn start(&self) -> Result<()>;

    /// Refuse further sends, drain the outgoing queue (bounded) and disconnect.
    async fn stop(&self);
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Primary first, then fallback.
    pub urls: Vec<String>,
    pub api_key: Option<String>,
    pub client_name: String,
    pub client_version: String,
    /// Sent as `X-Env` when present.
    pub env_hint: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    /// Upper bound for draining the outgoing queue on stop.
    pub drain_timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            api_key: None,
            client_name: crate::settings::CLIENT_NAME.to_string(),
            client_version: crate::VERSION.to_string(),
            env_hint: None,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            client_name: settings.client_name.clone(),
            client_version: settings.client_version.clone(),
            env_hint: Some(settings.system_provider.clone()),
            reconnect: ReconnectPolicy::new(
                settings.api_retry_limit,
                Duration::from_secs(settings.api_wait_limit),
            ),
            connect_timeout: Duration::from_secs(settings.api_timeout),
            ..Self::new(settings.api_urls())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    id: Uuid,
    config: ClientConfig,
    fatal: Arc<dyn FatalHandler>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    outgoing: BridgeQueue<String>,
    /// Last assigned outgoing number. Held while enqueueing so queue order matches numbering.
    message_num: Mutex<i64>,
    in_flight: Mutex<Option<String>>,
    stopping: AtomicBool,
    connected: AtomicBool,
    attempt: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn send(&self, message_type: MessageType, payload: Value) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            debug!(%message_type, "not sending message since shutting down");
            return Err(Error::Stopping);
        }
        self.enqueue(message_type, payload);
        Ok(())
    }

    fn enqueue(&self, message_type: MessageType, payload: Value) {
        let mut num = lock(&self.message_num);
        *num += 1;
        self.outgoing.put(codec::encode(*num, message_type, payload));
        debug!(num = *num, %message_type, "queued message");
    }

    fn message_num(&self) -> i64 {
        *lock(&self.message_num)
    }

    fn handle_frame(&self, raw: &str, tracker: &mut AckTracker) {
        let envelope = match codec::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping undecodable message");
                return;
            }
        };
        let status = tracker.observe(envelope.num);
        if envelope.message_type == MessageType::Ack {
            // acks take a number from the server's sequence but are never acked back
            debug!(num = envelope.num, %status, payload = %envelope.payload, "received ack");
            return;
        }

        debug!(
            num = envelope.num,
            message_type = %envelope.message_type,
            %status,
            "received message"
        );
        self.enqueue(MessageType::Ack, codec::ack_payload(envelope.num, status));
        if !codec::should_dispatch(status, envelope.message_type) {
            return;
        }

        let subscribers = match self.subscribers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for subscriber in subscribers {
            match subscriber.on_server_message(envelope.message_type, &envelope.payload) {
                Ok(Some((reply_type, reply))) => {
                    // refused replies are already logged by send
                    let _ = self.send(reply_type, reply);
                }
                Ok(None) => {}
                Err(err) => error!(
                    message_type = %envelope.message_type,
                    error = %err,
                    "subscriber failed to handle message"
                ),
            }
        }
    }

    /// Next frame to write: the in-flight frame from a failed session first.
    async fn next_frame(&self) -> Option<String> {
        let pending = lock(&self.in_flight).clone();
        if pending.is_some() {
            return pending;
        }
        let frame = self.outgoing.get_async().await?;
        *lock(&self.in_flight) = Some(frame.clone());
        Some(frame)
    }

    async fn produce(&self, sink: &mut SplitSink<WsStream, Message>) -> std::result::Result<(), TransportError> {
        while let Some(frame) = self.next_frame().await {
            sink.send(Message::Text(frame.into()))
                .await
                .map_err(|e| TransportError::Closed(e.to_string()))?;
            *lock(&self.in_flight) = None;
            self.outgoing.task_done();
        }
        Err(TransportError::Closed("outgoing queue disconnected".into()))
    }

    async fn consume(
        &self,
        source: &mut SplitStream<WsStream>,
        tracker: &mut AckTracker,
    ) -> std::result::Result<(), TransportError> {
        while let Some(message) = source.next().await {
            match message.map_err(|e| TransportError::Closed(e.to_string()))? {
                Message::Text(text) => self.handle_frame(text.as_str(), tracker),
                Message::Close(frame) => {
                    let reason = frame.map_or_else(|| "closed by server".to_string(), |f| f.to_string());
                    return Err(TransportError::Closed(reason));
                }
                _ => {}
            }
        }
        Err(TransportError::Closed("stream ended".into()))
    }

    /// Run one session. `Ok` means shutdown was requested.
    async fn session(
        &self,
        stream: WsStream,
        tracker: &mut AckTracker,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), TransportError> {
        let (mut sink, mut source) = stream.split();
        let outcome = tokio::select! {
            result = self.produce(&mut sink) => result,
            result = self.consume(&mut source, tracker) => result,
            _ = shutdown.wait_for(|stop| *stop) => Ok(()),
        };
        if outcome.is_ok() {
            let _ = sink.send(Message::Close(None)).await;
        }
        outcome
    }

    async fn connect(&self, url: &str, attempt: u32) -> std::result::Result<WsStream, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            url: url.to_string(),
            reason,
        };
        let mut request = url
            .into_client_request()
            .map_err(|e| connect_error(e.to_string()))?;
        let headers = [
            ("x-api-key", self.config.api_key.clone().unwrap_or_default()),
            ("x-client-name", self.config.client_name.clone()),
            ("x-client-version", self.config.client_version.clone()),
            ("x-connection-attempt", attempt.to_string()),
            ("x-connection-id", self.id.to_string()),
            ("x-message-num", self.message_num().to_string()),
            ("x-message-format", "json".to_string()),
        ];
        let env = self.config.env_hint.clone().map(|hint| ("x-env", hint));
        for (name, value) in headers.into_iter().chain(env) {
            let value = HeaderValue::from_str(&value).map_err(|e| connect_error(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        debug!(url, attempt, "connecting to server");
        match tokio::time::timeout(self.config.connect_timeout, connect_async(request)).await {
            Err(_) => Err(TransportError::Timeout {
                url: url.to_string(),
                timeout_secs: self.config.connect_timeout.as_secs(),
            }),
            Ok(Err(tungstenite::Error::Http(response))) => Err(TransportError::Rejected {
                url: url.to_string(),
                status: response.status().as_u16(),
            }),
            Ok(Err(err)) => Err(connect_error(err.to_string())),
            Ok(Ok((stream, _))) => Ok(stream),
        }
    }

    fn give_up(&self, attempt: u32) -> TransportError {
        let diagnostic = Diagnostic::new(GIVE_UP_TITLE, GIVE_UP_BODY)
            .with_meta("Client-Name", &self.config.client_name)
            .with_meta("Client-Version", &self.config.client_version)
            .with_meta("Connection-Attempt", attempt)
            .with_meta("Connection-ID", self.id);
        self.fatal.abort(&diagnostic);
        TransportError::GaveUp {
            attempts: attempt,
            connection_id: self.id.to_string(),
        }
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let mut urls = UrlRotation::new(self.config.urls.clone());
        let mut shutdown = self.shutdown.subscribe();
        let mut tracker = AckTracker::new();
        let mut attempt = 1u32;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let Some(url) = urls.current().map(str::to_string) else {
                return Err(Error::Runtime("no server URL configured".into()));
            };
            self.attempt.store(attempt, Ordering::SeqCst);
            let started = Instant::now();

            match self.connect(&url, attempt).await {
                Ok(stream) => {
                    info!(url = %url, attempt, "connected to server");
                    attempt = 1;
                    self.connected.store(true, Ordering::SeqCst);
                    let outcome = self.session(stream, &mut tracker, &mut shutdown).await;
                    self.connected.store(false, Ordering::SeqCst);
                    match outcome {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            debug!(error = %err, "session ended");
                            warn!("connection closed, will try to re-connect");
                        }
                    }
                }
                Err(err) => {
                    match &err {
                        TransportError::Rejected { status, .. } => {
                            warn!(attempt, "server error [code: {status}], will try to re-connect");
                        }
                        other => warn!(attempt, error = %other, "connection error, will try to re-connect"),
                    }
                    if self.config.reconnect.is_exhausted(attempt) {
                        return Err(self.give_up(attempt).into());
                    }
                }
            }

            attempt += 1;
            urls.rotate();
            let wait = self.config.reconnect.delay_for_attempt(attempt, started.elapsed());
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "retrying connection");
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                }
            }
        }
    }
}

/// Websocket client with reconnect, numbering and ack bookkeeping.
pub struct Client {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("urls", &self.shared.config.urls)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client that aborts the process when it gives up.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_fatal_handler(config, exit_process())
    }

    pub fn with_fatal_handler(config: ClientConfig, fatal: Arc<dyn FatalHandler>) -> Result<Self> {
        for url in &config.urls {
            let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(TransportError::InvalidUrl {
                    url: url.clone(),
                    reason: format!("expected ws:// or wss://, got {}://", parsed.scheme()),
                }
                .into());
            }
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                config,
                fatal,
                subscribers: RwLock::new(Vec::new()),
                outgoing: BridgeQueue::new(),
                message_num: Mutex::new(0),
                in_flight: Mutex::new(None),
                stopping: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                attempt: AtomicU32::new(0),
                shutdown,
            }),
            task: Mutex::new(None),
        })
    }

    /// Connection id sent as `X-Connection-ID`, stable across reconnects.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Last assigned outgoing number.
    pub fn message_num(&self) -> i64 {
        self.shared.message_num()
    }

    /// Current connection attempt, 1-based. Zero before the first attempt.
    pub fn connection_attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Frames queued or in flight that were not written yet.
    pub fn pending(&self) -> usize {
        self.shared.outgoing.unfinished()
    }

    /// Wait for the connection loop to end and return its result.
    pub async fn join(&self) -> Result<()> {
        let handle = lock(&self.task).take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Runtime(format!("client task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for Client {
    fn send(&self, message_type: MessageType, payload: Value) -> Result<()> {
        self.shared.send(message_type, payload)
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        match self.shared.subscribers.write() {
            Ok(mut guard) => guard.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    async fn start(&self) -> Result<()> {
        let mut task = lock(&self.task);
        if task.is_some() {
            return Ok(());
        }
        debug!(connection_id = %self.shared.id, "client: starting");
        *task = Some(tokio::spawn(Arc::clone(&self.shared).run()));
        Ok(())
    }

    async fn stop(&self) {
        debug!(connection_id = %self.shared.id, "client: shutting down");
        self.shared.stopping.store(true, Ordering::SeqCst);

        let drain = self.shared.config.drain_timeout;
        if tokio::time::timeout(drain, self.shared.outgoing.join_async())
            .await
            .is_err()
        {
            warn!(
                pending = self.shared.outgoing.unfinished(),
                "outgoing messages not sent before shutdown"
            );
        }
        self.shared.shutdown.send_replace(true);

        let handle = lock(&self.task).take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(Duration::from_secs(5), &mut handle).await {
                Ok(Ok(Err(err))) => debug!(error = %err, "client loop ended with error"),
                Ok(_) => {}
                Err(_) => handle.abort(),
            }
        }
    }
}
