//! Home Assistant session management.
//!
//! [`HubClient`] keeps one WebSocket session to the hub alive: it answers the
//! authentication challenge, correlates command replies by id, and reconnects
//! after a fixed delay when the socket drops. Single-entity lookups go through
//! the REST API instead.

pub(crate) mod protocol;
pub mod types;

use std::{collections::HashMap, fmt, mem, sync::Arc, sync::Mutex, time::Duration};

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    emitter::{EventEmitter, Topic},
    error::{Error, Result},
    sync::lock,
};
use protocol::{AuthFrame, Command, CommandFrame, HubMessage};
pub use types::{
    DomainServices, Entity, HubEvent, Service, State, StateChangedEvent, STATE_CHANGED,
};

/// Emitted after the hub accepts the access token.
pub const CONNECTED: Topic<()> = Topic::new("connected");
/// Emitted when an authenticated socket drops; a reconnect follows.
pub const DISCONNECTED: Topic<()> = Topic::new("disconnected");
/// Emitted on authentication rejection and socket failures.
pub const ERROR: Topic<HubFailure> = Topic::new("error");

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Payload of the [`ERROR`] topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubFailure {
    /// The hub rejected the token. The session is not retried.
    Authentication(String),
    /// The socket failed; the session reconnects on its own.
    Socket(String),
}

impl fmt::Display for HubFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication(message) => write!(f, "authentication failed: {message}"),
            Self::Socket(message) => write!(f, "socket error: {message}"),
        }
    }
}

impl From<&HubFailure> for Error {
    fn from(failure: &HubFailure) -> Self {
        match failure {
            HubFailure::Authentication(message) => Error::Authentication {
                message: message.clone(),
            },
            HubFailure::Socket(message) => Error::WebSocketConnect(message.clone()),
        }
    }
}

/// Connection settings for a [`HubClient`].
#[derive(Debug)]
pub struct HubConfig {
    /// WebSocket URL, e.g. `ws://homeassistant.local:8123/api/websocket`.
    pub url: Url,
    /// Long-lived access token.
    pub token: SecretString,
    /// Wait between a dropped session and the next connection attempt.
    pub reconnect_delay: Duration,
}

impl HubConfig {
    /// Creates a configuration with the default reconnect delay.
    ///
    /// # Arguments
    ///
    /// * `url` - WebSocket URL of the hub
    /// * `token` - Long-lived access token
    ///
    /// # Returns
    ///
    /// The configuration, or `Error::InvalidUrl` if `url` does not parse
    pub fn new(url: &str, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            url: Url::parse(url)?,
            token: SecretString::from(token.into()),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }

    /// Overrides [`DEFAULT_RECONNECT_DELAY`].
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Where the session loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AuthPending,
    Connected,
    Disconnected,
}

type EventCallback = Arc<dyn Fn(&HubEvent) + Send + Sync>;
type Reply = oneshot::Sender<Result<Value>>;

enum Pending {
    /// Resolved and removed by the first reply.
    Once(Reply),
    /// A subscription: never removed while the connection lives.
    Recurring {
        on_event: EventCallback,
        ack: Option<Reply>,
    },
}

struct Session {
    state: ConnectionState,
    outbox: Option<mpsc::UnboundedSender<String>>,
    last_id: u64,
    pending: HashMap<u64, Pending>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum SessionEnd {
    Shutdown,
    Rejected,
    Dropped,
}

struct Inner {
    config: HubConfig,
    rest: reqwest::Client,
    rest_base: String,
    events: EventEmitter,
    session: Mutex<Session>,
    cancel: CancellationToken,
}

/// Client for the hub's WebSocket and REST APIs.
///
/// Cloning is cheap; clones share one session.
///
/// ```no_run
/// use streamdeck_hass_plugin::hass::{HubClient, HubConfig, CONNECTED};
///
/// # async fn example() -> Result<(), streamdeck_hass_plugin::Error> {
/// let hub = HubClient::new(HubConfig::new(
///     "ws://homeassistant.local:8123/api/websocket",
///     "your_access_token",
/// )?)?;
/// hub.events().on(CONNECTED, |_| println!("authenticated"));
/// hub.start();
/// hub.wait_connected().await?;
/// hub.call_service("light", "toggle", Some(serde_json::json!({ "entity_id": "light.kitchen" })))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<Inner>,
}

impl HubClient {
    /// Creates a client. No connection is made until [`start`](Self::start).
    pub fn new(config: HubConfig) -> Result<Self> {
        Self::with_http_client(config, reqwest::Client::new())
    }

    /// Like [`new`](Self::new), with a caller-supplied HTTP client for the
    /// REST calls.
    pub fn with_http_client(config: HubConfig, rest: reqwest::Client) -> Result<Self> {
        let rest_base = rest_base_url(&config.url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                rest,
                rest_base,
                events: EventEmitter::new(),
                session: Mutex::new(Session {
                    state: ConnectionState::Disconnected,
                    outbox: None,
                    last_id: 0,
                    pending: HashMap::new(),
                }),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Session lifecycle events: [`CONNECTED`], [`DISCONNECTED`] and [`ERROR`].
    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    pub fn url(&self) -> &Url {
        &self.inner.config.url
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.session).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Spawns the connect/reconnect loop.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run().await })
    }

    /// Stops the session loop. No reconnect is attempted afterwards.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Resolves once the hub has authenticated us, or fails with the first
    /// reported error.
    pub async fn wait_connected(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let on_connected = {
            let slot = slot.clone();
            self.events().once(CONNECTED, move |_| {
                if let Some(tx) = lock(&slot).take() {
                    let _ = tx.send(Ok(()));
                }
            })
        };
        let on_error = {
            let slot = slot.clone();
            self.events().once(ERROR, move |failure: &HubFailure| {
                if let Some(tx) = lock(&slot).take() {
                    let _ = tx.send(Err(failure.into()));
                }
            })
        };

        let outcome = if self.is_connected() {
            Ok(())
        } else {
            rx.await.unwrap_or(Err(Error::RequestAbandoned))
        };
        on_connected.unsubscribe();
        on_error.unsubscribe();
        outcome
    }

    /// Fetches one entity through `GET {base}/api/states/{entity_id}`.
    pub async fn get_state(&self, entity_id: &str) -> Result<State> {
        let url = format!("{}/api/states/{}", self.inner.rest_base, entity_id);
        tracing::debug!(%url, "Fetching entity state");
        let state = self
            .inner
            .rest
            .get(&url)
            .bearer_auth(self.inner.config.token.expose_secret())
            .send()
            .await?
            .error_for_status()?
            .json::<State>()
            .await?;
        Ok(state)
    }

    /// Fetches every entity state over the WebSocket session.
    ///
    /// # Returns
    ///
    /// The states in hub order, or `Error::NotConnected` before the hub has
    /// authenticated us
    pub async fn get_states(&self) -> Result<Vec<State>> {
        let result = self.inner.request(Command::GetStates).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// States whose entity id starts with `{domain}.`, in hub order.
    pub async fn get_states_by_domain(&self, domain: &str) -> Result<Vec<State>> {
        let prefix = format!("{domain}.");
        let states = self.get_states().await?;
        Ok(states
            .into_iter()
            .filter(|state| state.entity_id.starts_with(&prefix))
            .collect())
    }

    /// Fetches the service catalogue, keyed by domain. Each service carries
    /// its own name as `id`.
    pub async fn get_services(&self) -> Result<DomainServices> {
        let result = self.inner.request(Command::GetServices).await?;
        match result {
            Value::Object(raw) => Ok(types::flatten_services(raw)?),
            Value::Null => Ok(DomainServices::new()),
            other => Err(Error::CommandFailed {
                code: "unexpected_result".into(),
                message: format!("get_services returned {other}"),
            }),
        }
    }

    /// Services of one domain; empty when the hub knows none.
    pub async fn get_services_by_domain(&self, domain: &str) -> Result<Vec<Service>> {
        let mut services = self.get_services().await?;
        Ok(services.remove(domain).unwrap_or_default())
    }

    /// Subscribes to `state_changed` events. `on_event` runs for every event
    /// on this subscription until the connection ends. Returns the
    /// subscription id once the hub acknowledges it.
    pub async fn subscribe_events<F>(&self, on_event: F) -> Result<u64>
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.send_command(
            Command::SubscribeEvents {
                event_type: STATE_CHANGED.to_string(),
            },
            Some(Pending::Recurring {
                on_event: Arc::new(on_event),
                ack: Some(tx),
            }),
        )?;
        rx.await.map_err(|_| Error::RequestAbandoned)??;
        tracing::debug!(id, "Subscribed to state changes");
        Ok(id)
    }

    /// Calls a service on the hub.
    ///
    /// # Arguments
    ///
    /// * `domain` - The domain of the service (e.g., "light", "switch")
    /// * `service` - The service to call (e.g., "turn_on", "toggle")
    /// * `service_data` - Optional data to pass to the service, usually
    ///   including `entity_id`
    ///
    /// # Returns
    ///
    /// Ok(()) once the hub reports success, or `Error::CommandFailed` with
    /// the hub's error code
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use streamdeck_hass_plugin::HubClient;
    /// # async fn example(hub: HubClient) -> Result<(), streamdeck_hass_plugin::Error> {
    /// hub.call_service(
    ///     "light",
    ///     "turn_on",
    ///     Some(serde_json::json!({
    ///         "entity_id": "light.living_room",
    ///         "brightness_pct": 75
    ///     })),
    /// )
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
    ) -> Result<()> {
        self.inner
            .request(Command::CallService {
                domain: domain.to_string(),
                service: service.to_string(),
                service_data,
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for HubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubClient")
            .field("url", &self.inner.config.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.serve().await {
                Ok(SessionEnd::Shutdown) => {
                    self.detach();
                    break;
                }
                Ok(SessionEnd::Rejected) => {
                    self.detach();
                    tracing::warn!("Hub rejected the access token, not reconnecting");
                    break;
                }
                Ok(SessionEnd::Dropped) => {
                    self.detach();
                    self.events.emit(DISCONNECTED, &());
                }
                Err(e) => {
                    self.detach();
                    tracing::warn!(error = %e, url = %self.config.url, "Hub connection failed");
                    self.events.emit(ERROR, &HubFailure::Socket(e.to_string()));
                }
            }

            let delay = self.config.reconnect_delay;
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting to hub");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!("Hub session loop exiting");
    }

    async fn serve(&self) -> Result<SessionEnd> {
        tracing::info!(url = %self.config.url, "Connecting to hub");
        let (stream, _response) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
        let (mut write, mut read) = stream.split();
        let mut outbox = self.attach();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = write.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                Some(frame) = outbox.recv() => {
                    if let Err(e) = write.send(Message::text(frame)).await {
                        self.socket_failed(&e.to_string());
                        return Ok(SessionEnd::Dropped);
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_text(&text) == Flow::Stop {
                            let _ = write.close().await;
                            return Ok(SessionEnd::Rejected);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Hub closed the connection");
                        return Ok(SessionEnd::Dropped);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.socket_failed(&e.to_string());
                        let _ = write.close().await;
                        return Ok(SessionEnd::Dropped);
                    }
                    None => {
                        tracing::info!("Hub stream ended");
                        return Ok(SessionEnd::Dropped);
                    }
                }
            }
        }
    }

    fn socket_failed(&self, message: &str) {
        tracing::warn!(error = message, "Hub socket error");
        self.events
            .emit(ERROR, &HubFailure::Socket(message.to_string()));
    }

    /// Installs a fresh outbox for a new socket. Ids restart from the seed.
    fn attach(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = lock(&self.session);
        session.outbox = Some(tx);
        session.last_id = 0;
        session.pending.clear();
        rx
    }

    /// Tears the session down; callers still waiting get `RequestAbandoned`.
    fn detach(&self) {
        let orphaned = {
            let mut session = lock(&self.session);
            session.outbox = None;
            session.state = ConnectionState::Disconnected;
            mem::take(&mut session.pending)
        };
        if !orphaned.is_empty() {
            tracing::debug!(count = orphaned.len(), "Expiring pending hub requests");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        lock(&self.session).state = state;
    }

    fn handle_text(&self, text: &str) -> Flow {
        let message: HubMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed hub frame");
                return Flow::Continue;
            }
        };

        match message {
            HubMessage::AuthRequired { ha_version } => {
                tracing::debug!(?ha_version, "Hub requested authentication");
                self.set_state(ConnectionState::AuthPending);
                if let Err(e) = self.send_auth() {
                    tracing::warn!(error = %e, "Could not send authentication");
                }
            }
            HubMessage::AuthOk { ha_version } => {
                self.set_state(ConnectionState::Connected);
                tracing::info!(?ha_version, "Hub connection authenticated");
                self.events.emit(CONNECTED, &());
            }
            HubMessage::AuthInvalid { message } | HubMessage::AuthFailed { message } => {
                let message = message.unwrap_or_else(|| "access token rejected".to_string());
                tracing::error!(%message, "Hub authentication failed");
                self.events
                    .emit(ERROR, &HubFailure::Authentication(message));
                return Flow::Stop;
            }
            HubMessage::Result {
                id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result)
                } else {
                    let error = error.unwrap_or_else(|| protocol::ErrorBody {
                        code: "unknown_error".into(),
                        message: String::new(),
                    });
                    Err(Error::CommandFailed {
                        code: error.code,
                        message: error.message,
                    })
                };
                self.resolve_result(id, outcome);
            }
            HubMessage::Event { id, event } => self.resolve_event(id, event),
            HubMessage::Unknown => tracing::trace!("Ignoring unrecognized hub frame"),
        }
        Flow::Continue
    }

    fn resolve_result(&self, id: u64, outcome: Result<Value>) {
        let mut session = lock(&self.session);
        match session.pending.remove(&id) {
            Some(Pending::Once(reply)) => {
                drop(session);
                let _ = reply.send(outcome);
            }
            Some(Pending::Recurring { on_event, ack }) => {
                session.pending.insert(id, Pending::Recurring { on_event, ack: None });
                drop(session);
                if let Some(ack) = ack {
                    let _ = ack.send(outcome);
                }
            }
            None => tracing::trace!(id, "Ignoring result for unknown request"),
        }
    }

    fn resolve_event(&self, id: u64, event: Value) {
        let mut session = lock(&self.session);
        let callback = match session.pending.get(&id) {
            Some(Pending::Recurring { on_event, .. }) => Some(on_event.clone()),
            Some(Pending::Once(_)) => None,
            None => {
                tracing::trace!(id, "Ignoring event for unknown subscription");
                return;
            }
        };

        match callback {
            Some(on_event) => {
                drop(session);
                match serde_json::from_value::<HubEvent>(event) {
                    Ok(event) => on_event(&event),
                    Err(e) => tracing::debug!(id, error = %e, "Ignoring malformed hub event"),
                }
            }
            None => {
                if let Some(Pending::Once(reply)) = session.pending.remove(&id) {
                    drop(session);
                    let _ = reply.send(Ok(event));
                }
            }
        }
    }

    fn send_auth(&self) -> Result<()> {
        let frame = serde_json::to_string(&AuthFrame::new(self.config.token.expose_secret()))?;
        let session = lock(&self.session);
        let outbox = session.outbox.as_ref().ok_or(Error::NotConnected)?;
        outbox.send(frame).map_err(|_| Error::NotConnected)
    }

    fn send_command(&self, command: Command, pending: Option<Pending>) -> Result<u64> {
        let mut session = lock(&self.session);
        if session.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let Some(outbox) = session.outbox.clone() else {
            return Err(Error::NotConnected);
        };

        session.last_id += 1;
        let id = session.last_id;
        let frame = serde_json::to_string(&CommandFrame {
            id,
            command: &command,
        })?;
        if let Some(pending) = pending {
            session.pending.insert(id, pending);
        }
        if outbox.send(frame).is_err() {
            session.pending.remove(&id);
            return Err(Error::NotConnected);
        }
        tracing::trace!(id, ?command, "Sent hub command");
        Ok(id)
    }

    async fn request(&self, command: Command) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send_command(command, Some(Pending::Once(tx)))?;
        rx.await.map_err(|_| Error::RequestAbandoned)?
    }
}

/// Derives the REST base from the WebSocket URL:
/// `ws://host:8123/api/websocket` becomes `http://host:8123`.
pub fn rest_base_url(ws_url: &Url) -> Result<String> {
    let scheme = match ws_url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(Error::Config(format!("unsupported hub URL scheme '{other}'")));
        }
    };
    let mut base = ws_url.clone();
    base.set_scheme(scheme)
        .map_err(|()| Error::Config(format!("cannot use scheme '{scheme}' for {ws_url}")))?;
    let path = base.path().trim_end_matches('/');
    let path = path.strip_suffix("/api/websocket").unwrap_or(path).to_string();
    base.set_path(&path);
    base.set_query(None);
    base.set_fragment(None);
    Ok(base.as_str().trim_end_matches('/').to_string())
}
