//! Flow controller task.
//!
//! The [`Distribution`] is owned by one task; everything else talks to it
//! through [`FlowController`] handles. Messages from every receive loop,
//! settle requests from callers, the scarce-mode watchdog and backoff
//! expiry are therefore applied one at a time.
//!
//! Readiness is sent to a broker by a small pusher task per connection fed
//! through a `watch` channel, so a slow connection never stalls the
//! controller and only the latest value is sent.

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info_span, warn, Instrument, Span};

use super::state::{Distribution, DistributionSnapshot};
use crate::connection::{Connection, ConnectionId, MessageHandler};
use crate::consumer::{Delivery, DeliveryQueue};
use crate::error::{NsqError, Result};
use crate::protocol::{Command, Message, MessageId};

/// How a settled message affects its connection's backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; shrinks backoff.
    Success,
    /// Failed; grows backoff.
    Failure,
    /// Dropped locally; backoff unchanged.
    Discard,
}

enum FlowCommand {
    AddConnection {
        connection: Connection,
        reply: oneshot::Sender<()>,
    },
    RemoveConnection {
        id: ConnectionId,
        reply: oneshot::Sender<Result<Vec<MessageId>>>,
    },
    ResetConnection {
        id: ConnectionId,
        reply: oneshot::Sender<Result<Vec<MessageId>>>,
    },
    Deliver {
        connection: ConnectionId,
        message: Message,
    },
    Lookup {
        id: MessageId,
        reply: oneshot::Sender<Result<Connection>>,
    },
    Settle {
        id: MessageId,
        outcome: Outcome,
        reply: oneshot::Sender<Result<ConnectionId>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<Connection>>,
    },
    Snapshot {
        reply: oneshot::Sender<DistributionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<Connection>>,
    },
}

/// Flow controller settings.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Budget shared by all connections.
    pub max_in_flight: u64,
    /// Backoff step; `None` disables backoff.
    pub backoff_interval: Option<Duration>,
    /// Scarce-mode rotation period.
    pub watchdog_interval: Duration,
}

/// Handle to the flow controller task.
///
/// Cheaply cloneable. Also the [`MessageHandler`] given to consumer
/// connections: delivered messages are registered and queued from inside
/// the task.
#[derive(Clone)]
pub struct FlowController {
    commands: mpsc::UnboundedSender<FlowCommand>,
}

impl FlowController {
    /// Spawn the controller task. Registered messages are pushed to `queue`.
    pub fn spawn(config: FlowConfig, queue: Arc<DeliveryQueue>, span: Span) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let actor = FlowActor {
            distribution: Distribution::new(config.max_in_flight, config.backoff_interval),
            attached: HashMap::new(),
            queue,
            watchdog_interval: config.watchdog_interval,
        };
        let task = tokio::spawn(actor.run(rx).instrument(span));
        (Self { commands }, task)
    }

    /// Start distributing readiness to `connection`.
    pub async fn add_connection(&self, connection: Connection) -> Result<()> {
        self.request(|reply| FlowCommand::AddConnection { connection, reply })
            .await
    }

    /// Stop distributing to a connection; purges its in-flight entries and
    /// queued messages.
    pub async fn remove_connection(&self, id: &ConnectionId) -> Result<Vec<MessageId>> {
        let id = id.clone();
        self.request(|reply| FlowCommand::RemoveConnection { id, reply })
            .await?
    }

    /// Forget broker-side state after a reconnect and announce readiness
    /// again.
    pub async fn reset_connection(&self, id: &ConnectionId) -> Result<Vec<MessageId>> {
        let id = id.clone();
        self.request(|reply| FlowCommand::ResetConnection { id, reply })
            .await?
    }

    /// Connection a message was delivered on.
    pub async fn lookup(&self, id: &MessageId) -> Result<Connection> {
        let id = *id;
        self.request(|reply| FlowCommand::Lookup { id, reply }).await?
    }

    /// Unregister a message and apply `outcome` to its connection.
    pub async fn settle(&self, id: &MessageId, outcome: Outcome) -> Result<ConnectionId> {
        let id = *id;
        self.request(|reply| FlowCommand::Settle { id, outcome, reply })
            .await?
    }

    /// Connections currently registered.
    pub async fn connections(&self) -> Result<Vec<Connection>> {
        self.request(|reply| FlowCommand::Connections { reply }).await
    }

    /// Copy of the distribution state.
    pub async fn snapshot(&self) -> Result<DistributionSnapshot> {
        self.request(|reply| FlowCommand::Snapshot { reply }).await
    }

    /// Stop the task and hand back the registered connections.
    pub async fn shutdown(&self) -> Vec<Connection> {
        self.request(|reply| FlowCommand::Shutdown { reply })
            .await
            .unwrap_or_default()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> FlowCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| NsqError::ConnectionClosed)?;
        response.await.map_err(|_| NsqError::ConnectionClosed)
    }
}

impl MessageHandler for FlowController {
    fn on_message(&self, connection: &ConnectionId, message: Message) {
        let command = FlowCommand::Deliver {
            connection: connection.clone(),
            message,
        };
        if self.commands.send(command).is_err() {
            debug!(%connection, "flow controller stopped, dropping message");
        }
    }
}

struct Attached {
    connection: Connection,
    readiness: watch::Sender<u64>,
    pusher: JoinHandle<()>,
    msg_timeout: Option<Duration>,
}

struct FlowActor {
    distribution: Distribution,
    attached: HashMap<ConnectionId, Attached>,
    queue: Arc<DeliveryQueue>,
    watchdog_interval: Duration,
}

impl FlowActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<FlowCommand>) {
        let mut watchdog = interval_at(
            Instant::now() + self.watchdog_interval,
            self.watchdog_interval,
        );
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let backoff = self.distribution.next_backoff_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    None => {
                        self.detach_all();
                        break;
                    }
                },
                _ = watchdog.tick(), if self.distribution.is_scarce() => {
                    self.distribution.rotate(&mut rand::rng(), Instant::now());
                    self.push_updates();
                }
                _ = backoff_expiry(backoff) => {
                    self.distribution.expire_backoff(Instant::now());
                    self.push_updates();
                }
            }
        }
        debug!("flow controller stopped");
    }

    /// Apply one command; returns `false` once the task should stop.
    fn handle(&mut self, command: FlowCommand) -> bool {
        let now = Instant::now();
        match command {
            FlowCommand::AddConnection { connection, reply } => {
                self.attach(connection, now);
                self.push_updates();
                let _ = reply.send(());
            }
            FlowCommand::RemoveConnection { id, reply } => {
                if let Some(attached) = self.attached.remove(&id) {
                    attached.pusher.abort();
                }
                let dropped = self.queue.deregister(&id);
                let result = self.distribution.remove_connection(&id, now);
                debug!(connection = %id, dropped, "connection removed from distribution");
                self.push_updates();
                let _ = reply.send(result);
            }
            FlowCommand::ResetConnection { id, reply } => {
                let dropped = self.queue.deregister(&id);
                if let Some(attached) = self.attached.get_mut(&id) {
                    attached.msg_timeout = attached
                        .connection
                        .settings()
                        .and_then(|settings| settings.msg_timeout());
                }
                let result = self.distribution.reset_connection(&id, now);
                debug!(connection = %id, dropped, "connection state reset");
                self.push_updates();
                let _ = reply.send(result);
            }
            FlowCommand::Deliver { connection, message } => self.deliver(connection, message, now),
            FlowCommand::Lookup { id, reply } => {
                let result = self.distribution.in_flight_lookup(&id).and_then(|owner| {
                    self.attached
                        .get(owner)
                        .map(|attached| attached.connection.clone())
                        .ok_or_else(|| {
                            NsqError::LookupFailed(format!("connection {} is not attached", owner))
                        })
                });
                let _ = reply.send(result);
            }
            FlowCommand::Settle { id, outcome, reply } => {
                let result = self.settle(&id, outcome, now);
                self.push_updates();
                let _ = reply.send(result);
            }
            FlowCommand::Connections { reply } => {
                let connections = self
                    .attached
                    .values()
                    .map(|attached| attached.connection.clone())
                    .collect();
                let _ = reply.send(connections);
            }
            FlowCommand::Snapshot { reply } => {
                let _ = reply.send(self.distribution.snapshot());
            }
            FlowCommand::Shutdown { reply } => {
                let _ = reply.send(self.detach_all());
                return false;
            }
        }
        true
    }

    fn attach(&mut self, connection: Connection, now: Instant) {
        let id = connection.id().clone();
        let settings = connection.settings();
        let max_ready = settings.as_ref().and_then(|settings| settings.max_rdy_count);
        let msg_timeout = settings.as_ref().and_then(|settings| settings.msg_timeout());

        let (readiness, updates) = watch::channel(0);
        let span = info_span!("nsq_readiness", connection = %id);
        let pusher = tokio::spawn(push_readiness(connection.clone(), updates).instrument(span));
        let attached = Attached {
            connection,
            readiness,
            pusher,
            msg_timeout,
        };
        if let Some(previous) = self.attached.insert(id.clone(), attached) {
            previous.pusher.abort();
        }
        self.distribution.add_connection(id, max_ready, now);
    }

    /// Register and queue a delivered message.
    ///
    /// A redelivery of a message that is still queued replaces the queued
    /// copy; a redelivery of a message the caller already holds is dropped.
    fn deliver(&mut self, connection: ConnectionId, message: Message, now: Instant) {
        let id = message.id;
        match self.distribution.register_message(id, &connection, now) {
            Ok(()) => self.enqueue(connection, message, now),
            Err(NsqError::AlreadyInFlight(_)) if self.queue.scrub(&id) => {
                warn!(%connection, %id, "duplicate delivery, replacing queued copy");
                let _ = self.distribution.unregister_message(&id, now);
                match self.distribution.register_message(id, &connection, now) {
                    Ok(()) => self.enqueue(connection, message, now),
                    Err(err) => warn!(%connection, %id, error = %err, "dropping duplicate"),
                }
            }
            Err(err) => warn!(%connection, %id, error = %err, "untrackable message, dropping"),
        }
    }

    fn enqueue(&self, connection: ConnectionId, message: Message, now: Instant) {
        let deadline = self
            .attached
            .get(&connection)
            .and_then(|attached| attached.msg_timeout)
            .map(|timeout| now + timeout);
        debug!(%connection, id = %message.id, attempts = message.attempts, "message queued");
        self.queue.push(Delivery {
            connection,
            message,
            deadline,
        });
    }

    fn settle(&mut self, id: &MessageId, outcome: Outcome, now: Instant) -> Result<ConnectionId> {
        let connection = self.distribution.unregister_message(id, now)?;
        match outcome {
            Outcome::Success => self.distribution.success(&connection, now)?,
            Outcome::Failure => self.distribution.failure(&connection, now)?,
            Outcome::Discard => {}
        }
        Ok(connection)
    }

    fn push_updates(&mut self) {
        for (id, ready) in self.distribution.take_updates() {
            if let Some(attached) = self.attached.get(&id) {
                debug!(connection = %id, ready, "readiness update");
                attached.readiness.send_replace(ready);
            }
        }
    }

    fn detach_all(&mut self) -> Vec<Connection> {
        self.attached
            .drain()
            .map(|(_, attached)| {
                attached.pusher.abort();
                attached.connection
            })
            .collect()
    }
}

impl Drop for FlowActor {
    fn drop(&mut self) {
        for attached in self.attached.values() {
            attached.pusher.abort();
        }
    }
}

async fn backoff_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Send the latest readiness value whenever it changes.
async fn push_readiness(connection: Connection, mut updates: watch::Receiver<u64>) {
    while updates.changed().await.is_ok() {
        let count = *updates.borrow_and_update();
        if let Err(err) = connection.transmit(Command::Rdy(count)).await {
            warn!(count, error = %err, "failed to send readiness");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::protocol::{build_frame, frame_type};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const IDENTIFY_REPLY: &[u8] = br#"{"max_rdy_count":2500,"msg_timeout":60000}"#;

    async fn read_line(socket: &mut TcpStream) -> String {
        let mut line = Vec::new();
        loop {
            let byte = socket.read_u8().await.unwrap();
            if byte == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte);
        }
    }

    /// Accept one subscriber and finish its handshake.
    async fn accept(listener: &TcpListener) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut magic = [0u8; 4];
        socket.read_exact(&mut magic).await.unwrap();
        assert_eq!(read_line(&mut socket).await, "IDENTIFY");
        let len = socket.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        socket.read_exact(&mut body).await.unwrap();
        socket
            .write_all(&build_frame(frame_type::RESPONSE, IDENTIFY_REPLY))
            .await
            .unwrap();
        assert_eq!(read_line(&mut socket).await, "SUB events archive");
        socket.write_all(&build_frame(frame_type::RESPONSE, b"OK")).await.unwrap();
        socket
    }

    async fn send_message(socket: &mut TcpStream, id: &[u8; 16]) {
        let message = Message {
            timestamp: 1,
            attempts: 1,
            id: MessageId::new(*id),
            body: Bytes::from_static(b"payload"),
        };
        socket
            .write_all(&build_frame(frame_type::MESSAGE, &message.encode()))
            .await
            .unwrap();
    }

    async fn setup(max_in_flight: u64) -> (FlowController, Arc<DeliveryQueue>, TcpListener, Endpoint) {
        let queue = Arc::new(DeliveryQueue::new());
        let (flow, _task) = FlowController::spawn(
            FlowConfig {
                max_in_flight,
                backoff_interval: Some(Duration::from_secs(1)),
                watchdog_interval: Duration::from_secs(5),
            },
            queue.clone(),
            Span::none(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (flow, queue, listener, Endpoint::new("127.0.0.1", port))
    }

    async fn connect(endpoint: Endpoint, flow: &FlowController) -> Connection {
        Connection::builder(endpoint)
            .subscribe("events", "archive")
            .handler(flow.clone())
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_readiness_announced_and_message_settled() {
        let (flow, queue, listener, endpoint) = setup(5).await;
        let broker = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            assert_eq!(read_line(&mut socket).await, "RDY 5");
            send_message(&mut socket, b"0123456789abcdef").await;
            socket
        });

        let connection = connect(endpoint, &flow).await;
        flow.add_connection(connection.clone()).await.unwrap();

        let delivery = queue.pop().await.unwrap();
        assert_eq!(delivery.connection, *connection.id());
        assert!(delivery.deadline.is_some());

        let snapshot = flow.snapshot().await.unwrap();
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.total_in_flight(), 1);

        let owner = flow.lookup(&delivery.message.id).await.unwrap();
        assert_eq!(owner.id(), connection.id());

        let settled = flow.settle(&delivery.message.id, Outcome::Success).await.unwrap();
        assert_eq!(settled, *connection.id());
        assert_eq!(flow.snapshot().await.unwrap().in_flight, 0);

        let err = flow.settle(&delivery.message.id, Outcome::Success).await.unwrap_err();
        assert!(matches!(err, NsqError::LookupFailed(_)));
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_redelivery_replaces_queued_copy() {
        let (flow, queue, listener, endpoint) = setup(5).await;
        let broker = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            assert_eq!(read_line(&mut socket).await, "RDY 5");
            send_message(&mut socket, b"0123456789abcdef").await;
            send_message(&mut socket, b"0123456789abcdef").await;
            socket
        });

        let connection = connect(endpoint, &flow).await;
        flow.add_connection(connection).await.unwrap();
        let _socket = broker.await.unwrap();

        // Both frames are handled before the snapshot request is.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = flow.snapshot().await.unwrap();
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_never_outgrows_in_flight() {
        let (flow, queue, listener, endpoint) = setup(2).await;
        let broker = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            assert_eq!(read_line(&mut socket).await, "RDY 2");
            send_message(&mut socket, b"aaaaaaaaaaaaaaaa").await;
            send_message(&mut socket, b"bbbbbbbbbbbbbbbb").await;
            send_message(&mut socket, b"bbbbbbbbbbbbbbbb").await;
            socket
        });

        let connection = connect(endpoint, &flow).await;
        flow.add_connection(connection.clone()).await.unwrap();
        let _socket = broker.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = flow.snapshot().await.unwrap();
        assert_eq!(snapshot.in_flight, 2);
        assert_eq!(snapshot.total_ready(), 0);
        assert_eq!(queue.len(), snapshot.in_flight);

        let delivery = queue.pop().await.unwrap();
        flow.settle(&delivery.message.id, Outcome::Success).await.unwrap();
        let snapshot = flow.snapshot().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue.len() <= snapshot.in_flight);
        assert!(snapshot.in_flight as u64 <= snapshot.max_in_flight);
    }

    #[tokio::test]
    async fn test_remove_connection_purges_queue() {
        let (flow, queue, listener, endpoint) = setup(5).await;
        let broker = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            assert_eq!(read_line(&mut socket).await, "RDY 5");
            send_message(&mut socket, b"aaaaaaaaaaaaaaaa").await;
            send_message(&mut socket, b"bbbbbbbbbbbbbbbb").await;
            socket
        });

        let connection = connect(endpoint, &flow).await;
        flow.add_connection(connection.clone()).await.unwrap();
        let _socket = broker.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len(), 2);

        let purged = flow.remove_connection(connection.id()).await.unwrap();
        assert_eq!(purged.len(), 2);
        assert!(queue.is_empty());
        assert!(flow.connections().await.unwrap().is_empty());

        let err = flow.remove_connection(connection.id()).await.unwrap_err();
        assert!(matches!(err, NsqError::LookupFailed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_returns_connections_and_stops() {
        let (flow, _queue, listener, endpoint) = setup(1).await;
        tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            let _ = read_line(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let connection = connect(endpoint, &flow).await;
        flow.add_connection(connection).await.unwrap();

        let connections = flow.shutdown().await;
        assert_eq!(connections.len(), 1);
        assert!(matches!(flow.snapshot().await, Err(NsqError::ConnectionClosed)));
    }
}
