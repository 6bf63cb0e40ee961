//! One established session: the writer task plus the receive loop.
//!
//! A session lives from a successful handshake until the transport fails or
//! the connection is closed. Reconnecting replaces the whole session; the
//! generation number tells late failures of an old session apart from
//! failures of the current one.

use std::sync::{Arc, Weak};

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

use super::{Connection, ConnectionId, MessageHandler, Shared};
use crate::control::EndpointSettings;
use crate::error::{NsqError, Result};
use crate::protocol::{Command, Frame, FrameBuffer};
use crate::transport::{BoxedStream, Layer, Transport};
use crate::writer::{spawn_writer_task, OutboundCommand, WriterHandle};

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub(super) struct Session {
    pub(super) generation: u64,
    pub(super) writer: WriterHandle,
    pub(super) settings: EndpointSettings,
    pub(super) layers: Vec<Layer>,
    writer_task: JoinHandle<Result<()>>,
    receive_task: JoinHandle<()>,
}

impl Session {
    /// Split the negotiated transport and spawn the session tasks.
    pub(super) fn start(
        shared: &Arc<Shared>,
        generation: u64,
        transport: Transport,
        settings: EndpointSettings,
    ) -> Self {
        let layers = transport.layers().to_vec();
        let (reader, write_half) = transport.into_split();
        let (writer, writer_task) = spawn_writer_task(write_half, shared.config.writer.clone());

        let receiver = ReceiveLoop {
            connection: Arc::downgrade(shared),
            id: shared.id.clone(),
            generation,
            writer: writer.clone(),
            responses: shared.response_tx.clone(),
            handler: shared.handler.clone(),
            max_frame_size: shared.config.max_frame_size,
        };
        let receive_task = tokio::spawn(receiver.run(reader).instrument(shared.span.clone()));

        Self {
            generation,
            writer,
            settings,
            layers,
            writer_task,
            receive_task,
        }
    }

    /// Stop both tasks. Dropping the halves closes the socket.
    pub(super) fn abort(&self) {
        self.receive_task.abort();
        self.writer_task.abort();
    }
}

struct ReceiveLoop {
    connection: Weak<Shared>,
    id: ConnectionId,
    generation: u64,
    writer: WriterHandle,
    responses: mpsc::Sender<Frame>,
    handler: Option<Arc<dyn MessageHandler>>,
    max_frame_size: u32,
}

impl ReceiveLoop {
    async fn run(self, mut reader: ReadHalf<BoxedStream>) {
        let error = self.read_frames(&mut reader).await;
        debug!(generation = self.generation, error = %error, "receive loop stopped");
        if let Some(shared) = self.connection.upgrade() {
            Connection { inner: shared }.spawn_recovery(self.generation, error);
        }
    }

    /// Read until the transport fails; returns the failure.
    async fn read_frames(&self, reader: &mut ReadHalf<BoxedStream>) -> NsqError {
        let mut frames = FrameBuffer::with_max_payload(self.max_frame_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return NsqError::ConnectionClosed,
                Ok(n) => n,
                Err(e) => return NsqError::from_transport(e),
            };

            match frames.push(&buf[..n]) {
                Ok(batch) => batch.into_iter().for_each(|frame| self.dispatch(frame)),
                Err(e) => return e,
            }
        }
    }

    /// Route one frame. Never waits on the caller.
    fn dispatch(&self, frame: Frame) {
        if frame.is_heartbeat() {
            trace!("heartbeat");
            if let Err(err) = self.writer.try_send(OutboundCommand::new(&Command::Nop)) {
                warn!(error = %err, "failed to answer heartbeat");
            }
            return;
        }

        match frame {
            Frame::Message(message) => match &self.handler {
                Some(handler) => handler.on_message(&self.id, message),
                None => warn!(id = %message.id, "message received without a handler, dropping"),
            },
            frame => {
                debug!(frame_type = frame.frame_type(), text = ?frame.text(), "response frame");
                if self.responses.try_send(frame).is_err() {
                    warn!("response slot full, dropping response frame");
                }
            }
        }
    }
}
