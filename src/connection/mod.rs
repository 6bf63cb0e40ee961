//! Connection engine - one per broker endpoint.
//!
//! A [`Connection`] owns the transport to one broker, performs the handshake
//! (see [`crate::control`]), runs the receive loop and the writer task, and
//! recovers from transport failures by reconnecting with a linearly growing
//! pause. Handles are cheap to clone; the session tasks stop when the last
//! handle is dropped.
//!
//! # States
//!
//! ```text
//! Disconnected ─► Connecting ─► Negotiating ─► Ready ⇄ Reconnecting
//!                                                │          │
//!                                                └──────────┴─► Terminated
//! ```
//!
//! # Responses
//!
//! The protocol carries no request IDs and answers strictly in order, so
//! [`Connection::transmit`] holds an exclusive response section while it
//! waits. How long it waits depends on the command's [`ResponseClass`].
//!
//! # Example
//!
//! ```no_run
//! use nsq_client::config::Endpoint;
//! use nsq_client::connection::Connection;
//! use nsq_client::protocol::Command;
//!
//! # async fn run() -> nsq_client::Result<()> {
//! let connection = Connection::builder(Endpoint::new("127.0.0.1", 4150))
//!     .topic("events")
//!     .connect()
//!     .await?;
//!
//! connection
//!     .transmit(Command::Pub { topic: "events".into(), body: "hello".into() })
//!     .await?;
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

mod handshake;
mod session;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use self::session::Session;
use crate::config::{ConnectionConfig, Endpoint, FeatureOptions};
use crate::control::EndpointSettings;
use crate::error::{NsqError, Result};
use crate::protocol::{validate_name, Command, Frame, Message, ResponseClass};
use crate::transport::{connect_tcp, Layer, Transport};
use crate::writer::{OutboundCommand, WriterHandle};

/// Identity of a connection: endpoint plus topic and channel.
///
/// Producer connections have an empty channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    endpoint: Endpoint,
    topic: String,
    channel: String,
}

impl ConnectionId {
    /// Create a new identity.
    pub fn new(endpoint: Endpoint, topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            endpoint,
            topic: topic.into(),
            channel: channel.into(),
        }
    }

    /// Broker endpoint.
    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Topic name.
    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Channel name, empty for producers.
    #[inline]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.topic)?;
        if !self.channel.is_empty() {
            write!(f, "/{}", self.channel)?;
        }
        Ok(())
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Running the handshake.
    Negotiating,
    /// Usable.
    Ready,
    /// Transport lost, retrying.
    Reconnecting,
    /// Closed or failed for good.
    Terminated,
}

/// Lifecycle notifications for whoever owns the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport was replaced after a failure; broker-side state
    /// (readiness, in-flight messages) did not survive.
    Reconnected(ConnectionId),
    /// The connection gave up and will not be used again.
    Terminated {
        /// Connection that terminated.
        id: ConnectionId,
        /// Failure description.
        reason: String,
    },
}

/// Receiver of delivered messages.
///
/// Called from the receive loop, so implementations must return quickly and
/// never block.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message delivered on `connection`.
    fn on_message(&self, connection: &ConnectionId, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&ConnectionId, Message) + Send + Sync + 'static,
{
    fn on_message(&self, connection: &ConnectionId, message: Message) {
        self(connection, message)
    }
}

struct Shared {
    id: ConnectionId,
    config: ConnectionConfig,
    subscribe: bool,
    handler: Option<Arc<dyn MessageHandler>>,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    state: watch::Sender<ConnectionState>,
    /// Exclusive response-wait section.
    responses: Mutex<mpsc::Receiver<Frame>>,
    response_tx: mpsc::Sender<Frame>,
    /// Single-flight guard for reconnect and close.
    reconnect: Mutex<()>,
    session: StdMutex<Option<Session>>,
    generations: AtomicU64,
    span: Span,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_writer(&self) -> Option<(u64, WriterHandle)> {
        self.session()
            .as_ref()
            .map(|session| (session.generation, session.writer.clone()))
    }

    fn current_generation(&self) -> Option<u64> {
        self.session().as_ref().map(|session| session.generation)
    }

    fn replace_session(&self, session: Option<Session>) {
        if let Some(old) = std::mem::replace(&mut *self.session(), session) {
            old.abort();
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move forward through the connect states, unless reconnecting.
    fn advance(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Reconnecting || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = session.take() {
            session.abort();
        }
    }
}

/// Handle to a broker connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Connection {
    /// Start building a connection to `endpoint`.
    pub fn builder(endpoint: Endpoint) -> ConnectionBuilder {
        ConnectionBuilder::new(endpoint)
    }

    /// Connection identity.
    #[inline]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Settings granted by the broker for the current session.
    pub fn settings(&self) -> Option<EndpointSettings> {
        self.inner
            .session()
            .as_ref()
            .map(|session| session.settings.clone())
    }

    /// Transport layers installed in the current session.
    pub fn layers(&self) -> Vec<Layer> {
        self.inner
            .session()
            .as_ref()
            .map(|session| session.layers.clone())
            .unwrap_or_default()
    }

    /// Send a command and wait according to its response class.
    ///
    /// Returns the response frame when one arrived in time. A missing
    /// response is [`NsqError::NoResponse`] for commands that always get
    /// one; error frames become [`NsqError::BadResponse`].
    ///
    /// If the transport is lost before the command completes, the call
    /// waits for the reconnect and sends the command again on the new
    /// session. It fails when the reconnect gives up
    /// ([`NsqError::ConnectionFailure`] if this call ran the attempts,
    /// [`NsqError::ConnectionClosed`] if it only waited on them), on a fatal
    /// error, or when the session is lost more than `max_reconnect_attempts`
    /// times in a row.
    pub async fn transmit(&self, command: Command) -> Result<Option<Frame>> {
        let mut resends = 0;
        loop {
            let (generation, writer) = self.acquire_writer().await?;
            match self.send_on(generation, writer, &command).await {
                Err(NsqError::ConnectionUnavailable(reason))
                    if resends < self.inner.config.max_reconnect_attempts =>
                {
                    resends += 1;
                    debug!(
                        parent: &self.inner.span,
                        command = command.name(),
                        %reason,
                        resends,
                        "awaiting reconnect before resending"
                    );
                    match self.reconnect(generation).await {
                        Ok(()) | Err(NsqError::ConnectionClosed) => {}
                        Err(err) => return Err(err),
                    }
                }
                other => return other,
            }
        }
    }

    /// Close gracefully: CLS, then drop the transport.
    ///
    /// Failures are logged, not returned.
    pub async fn close(&self) {
        let shared = &self.inner;
        let _guard = shared.reconnect.lock().await;
        if shared.state() == ConnectionState::Terminated {
            return;
        }
        if let Some((generation, writer)) = shared.current_writer() {
            if let Err(err) = self.send_on(generation, writer, &Command::Cls).await {
                warn!(parent: &shared.span, error = %err, "CLS failed during close");
            }
        }
        shared.replace_session(None);
        shared.state.send_replace(ConnectionState::Terminated);
        info!(parent: &shared.span, "connection closed");
    }

    fn wait_for(&self, class: ResponseClass) -> Duration {
        match class {
            ResponseClass::Required => self.inner.config.response_wait,
            ResponseClass::ErrorOnly => self.inner.config.error_wait,
            ResponseClass::None => Duration::ZERO,
        }
    }

    async fn acquire_writer(&self) -> Result<(u64, WriterHandle)> {
        let shared = &self.inner;
        if let Some(found) = shared.current_writer() {
            return Ok(found);
        }
        if shared.state() == ConnectionState::Terminated {
            return Err(NsqError::ConnectionClosed);
        }
        // A reconnect holds the guard until it succeeds or gives up.
        drop(shared.reconnect.lock().await);
        shared.current_writer().ok_or_else(|| match shared.state() {
            ConnectionState::Terminated => NsqError::ConnectionClosed,
            state => NsqError::ConnectionUnavailable(format!("connection is {:?}", state)),
        })
    }

    async fn send_on(
        &self,
        generation: u64,
        writer: WriterHandle,
        command: &Command,
    ) -> Result<Option<Frame>> {
        let shared = &self.inner;
        let class = command.response_class();
        let wait = self.wait_for(class);

        if wait.is_zero() {
            debug!(parent: &shared.span, command = command.name(), "send");
            self.write(generation, &writer, command).await?;
            return Ok(None);
        }

        let mut responses = shared.responses.lock().await;
        while let Ok(stray) = responses.try_recv() {
            debug!(parent: &shared.span, text = ?stray.text(), "discarding stray response");
        }
        debug!(parent: &shared.span, command = command.name(), ?wait, "send and await response");
        self.write(generation, &writer, command).await?;

        let deadline = Instant::now() + wait;
        loop {
            match responses.try_recv() {
                Ok(frame) => {
                    command.check_response(&frame)?;
                    return Ok(Some(frame));
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(NsqError::ConnectionClosed)
                }
            }
            if shared.state() == ConnectionState::Terminated {
                return Err(NsqError::ConnectionClosed);
            }
            if shared.current_generation() != Some(generation) {
                return Err(NsqError::ConnectionUnavailable(format!(
                    "transport lost while awaiting response to {}",
                    command.name()
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(shared.config.response_interval.min(deadline - now)).await;
        }

        match class {
            ResponseClass::Required => Err(NsqError::NoResponse(command.name())),
            _ => Ok(None),
        }
    }

    async fn write(&self, generation: u64, writer: &WriterHandle, command: &Command) -> Result<()> {
        match writer.send(OutboundCommand::new(command)).await {
            Err(NsqError::ConnectionClosed) => {
                self.spawn_recovery(generation, NsqError::ConnectionClosed);
                Err(NsqError::ConnectionUnavailable(
                    "writer stopped, reconnecting".to_string(),
                ))
            }
            other => other,
        }
    }

    /// Open the socket, negotiate and start a new session.
    async fn establish(&self) -> Result<()> {
        let shared = &self.inner;
        shared.advance(ConnectionState::Connecting);
        let stream = connect_tcp(shared.id.endpoint(), shared.config.connect_timeout).await?;

        shared.advance(ConnectionState::Negotiating);
        let (transport, settings) =
            handshake::negotiate(Transport::new(stream), &shared.id, &shared.config, shared.subscribe)
                .await?;

        let generation = shared.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Session::start(shared, generation, transport, settings);
        info!(generation, layers = ?session.layers, "connection ready");
        shared.replace_session(Some(session));
        shared.state.send_replace(ConnectionState::Ready);
        Ok(())
    }

    /// Handle the failure of session `generation` in the background.
    pub(crate) fn spawn_recovery(&self, generation: u64, error: NsqError) {
        let connection = self.clone();
        let span = self.inner.span.clone();
        tokio::spawn(async move { connection.recover(generation, error).await }.instrument(span));
    }

    async fn recover(self, generation: u64, error: NsqError) {
        if error.is_fatal() {
            let _guard = self.inner.reconnect.lock().await;
            if self.inner.current_generation() == Some(generation) {
                self.terminate(error.to_string());
            }
            return;
        }
        if let Err(err) = self.reconnect(generation).await {
            debug!(error = %err, "recovery finished without a session");
        }
    }

    /// Replace session `failed_generation` with a new one.
    ///
    /// Single-flight: concurrent callers wait for the running attempt and
    /// then return without retrying. Gives up after
    /// `max_reconnect_attempts`, terminating the connection and returning
    /// [`NsqError::ConnectionFailure`] to the caller that ran the attempts.
    pub(crate) async fn reconnect(&self, failed_generation: u64) -> Result<()> {
        let shared = &self.inner;
        let _guard = shared.reconnect.lock().await;
        match shared.current_generation() {
            Some(current) if current == failed_generation => {}
            Some(_) => return Ok(()),
            None => return Err(NsqError::ConnectionClosed),
        }

        shared.replace_session(None);
        shared.state.send_replace(ConnectionState::Reconnecting);
        warn!(generation = failed_generation, "transport lost, reconnecting");

        let max_attempts = shared.config.max_reconnect_attempts;
        for attempt in 1..=max_attempts {
            tokio::time::sleep(shared.config.reconnect_interval * attempt).await;
            match self.establish().await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    shared.emit(ConnectionEvent::Reconnected(shared.id.clone()));
                    return Ok(());
                }
                Err(err) if err.is_fatal() || matches!(err, NsqError::FeatureFailure(_)) => {
                    self.terminate(err.to_string());
                    return Err(err);
                }
                Err(err) => warn!(attempt, max_attempts, error = %err, "reconnect attempt failed"),
            }
        }

        let err = NsqError::ConnectionFailure {
            attempts: max_attempts,
        };
        self.terminate(err.to_string());
        Err(err)
    }

    fn terminate(&self, reason: String) {
        let shared = &self.inner;
        shared.replace_session(None);
        if shared.state.send_replace(ConnectionState::Terminated) != ConnectionState::Terminated {
            error!(parent: &shared.span, %reason, "connection terminated");
            shared.emit(ConnectionEvent::Terminated {
                id: shared.id.clone(),
                reason,
            });
        }
    }
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    endpoint: Endpoint,
    topic: String,
    channel: String,
    subscribe: bool,
    config: ConnectionConfig,
    handler: Option<Arc<dyn MessageHandler>>,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl ConnectionBuilder {
    /// Create a builder with default settings.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            topic: String::new(),
            channel: String::new(),
            subscribe: false,
            config: ConnectionConfig::default(),
            handler: None,
            events: None,
        }
    }

    /// Replace the whole connection configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Topic this connection publishes to.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Subscribe to `topic`/`channel` during every handshake.
    pub fn subscribe(mut self, topic: impl Into<String>, channel: impl Into<String>) -> Self {
        self.topic = topic.into();
        self.channel = channel.into();
        self.subscribe = true;
        self
    }

    /// Receiver of delivered messages.
    pub fn handler(mut self, handler: impl MessageHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Receiver of delivered messages, already shared.
    pub fn shared_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Channel receiving lifecycle events.
    pub fn events(mut self, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Transport features to request.
    pub fn features(mut self, features: FeatureOptions) -> Self {
        self.config.features = features;
        self
    }

    /// Deadline for commands that always get a response.
    ///
    /// Default: 1 second
    pub fn response_wait(mut self, wait: Duration) -> Self {
        self.config.response_wait = wait;
        self
    }

    /// Reconnect attempts before giving up.
    ///
    /// Default: 10
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Pause step between reconnect attempts.
    ///
    /// Default: 1 second
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    /// Validate settings, connect and run the handshake.
    pub async fn connect(self) -> Result<Connection> {
        self.config.validate()?;
        if self.subscribe || !self.topic.is_empty() {
            validate_name("topic", &self.topic)?;
        }
        if self.subscribe {
            validate_name("channel", &self.channel)?;
        }

        let span = info_span!(
            "nsq_connection",
            endpoint = %self.endpoint,
            topic = %self.topic,
            channel = %self.channel
        );
        let (response_tx, response_rx) = mpsc::channel(self.config.response_capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let connection = Connection {
            inner: Arc::new(Shared {
                id: ConnectionId::new(self.endpoint, self.topic, self.channel),
                config: self.config,
                subscribe: self.subscribe,
                handler: self.handler,
                events: self.events,
                state,
                responses: Mutex::new(response_rx),
                response_tx,
                reconnect: Mutex::new(()),
                session: StdMutex::new(None),
                generations: AtomicU64::new(0),
                span: span.clone(),
            }),
        };

        if let Err(err) = connection.establish().instrument(span).await {
            connection
                .inner
                .state
                .send_replace(ConnectionState::Terminated);
            return Err(err);
        }
        Ok(connection)
    }
}
