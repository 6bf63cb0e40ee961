//! Dedicated writer task for outbound commands.
//!
//! Every connection owns one writer task that receives encoded commands
//! via an mpsc channel and writes them to the transport's write half.
//! Commands from the response waiter, the heartbeat answerer and
//! fire-and-forget callers are serialized in channel order.
//!
//! # Architecture
//!
//! ```text
//! transmit()   ─┐
//! heartbeat    ─┼─► mpsc::Sender<OutboundCommand> ─► Writer Task ─► transport
//! readiness    ─┘
//! ```
//!
//! Ready commands are batched into single vectored writes.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{NsqError, Result};
use crate::protocol::Command;

/// Default maximum pending commands before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_COMMANDS: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum commands to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded command ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    /// Command name, for logs.
    pub name: &'static str,
    /// Wire bytes.
    pub bytes: Bytes,
}

impl OutboundCommand {
    /// Encode a command.
    #[inline]
    pub fn new(command: &Command) -> Self {
        Self {
            name: command.name(),
            bytes: command.encode(),
        }
    }

    /// Encoded size.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending commands before backpressure kicks in.
    pub max_pending_commands: usize,
    /// Channel capacity for the command queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_commands: DEFAULT_MAX_PENDING_COMMANDS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending commands to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundCommand>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundCommand>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a command, waiting while backpressure is active.
    pub async fn send(&self, command: OutboundCommand) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(command).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            NsqError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(NsqError::ConnectionClosed);
            }
            if start.elapsed() > self.timeout {
                return Err(NsqError::ConnectionUnavailable(
                    "writer backpressure timeout".to_string(),
                ));
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending command count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a command without waiting.
    ///
    /// Used from the receive loop, which must never block.
    pub fn try_send(&self, command: OutboundCommand) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(NsqError::ConnectionUnavailable(
                "writer backpressure active".to_string(),
            ));
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(command).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    NsqError::ConnectionUnavailable("writer queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => NsqError::ConnectionClosed,
            }
        })
    }
}

/// Spawn the writer task and return a handle for sending commands.
///
/// The task ends with `Ok(())` once every handle is dropped and the queue
/// is drained, or with the first write error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_commands,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundCommand>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(command) => batch.push(command),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        trace!(batch_size, first = batch[0].name, "writing command batch");
        if let Err(err) = write_batch(&mut writer, &batch).await {
            warn!(error = %err, dropped = ?batch_names(&batch), "write failed, dropping command batch");
            return Err(NsqError::from_transport(err));
        }
        pending.fetch_sub(batch_size, Ordering::Release);
    }
    let _ = writer.shutdown().await;
    Ok(())
}

fn batch_names(batch: &[OutboundCommand]) -> Vec<&'static str> {
    batch.iter().map(|command| command.name).collect()
}

/// Write a batch using vectored I/O, continuing after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundCommand]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundCommand::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[OutboundCommand], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for command in batch {
        let end = offset + command.size();
        if skip_bytes < end && !command.bytes.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&command.bytes[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn rdy(count: u64) -> OutboundCommand {
        OutboundCommand::new(&Command::Rdy(count))
    }

    #[test]
    fn test_outbound_command_creation() {
        let command = OutboundCommand::new(&Command::Nop);
        assert_eq!(command.name, "NOP");
        assert_eq!(&command.bytes[..], b"NOP\n");
        assert_eq!(command.size(), 4);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_commands, DEFAULT_MAX_PENDING_COMMANDS);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for count in 1..=3 {
            handle.send(rdy(count)).await.unwrap();
        }

        let mut buf = vec![0u8; 18];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"RDY 1\nRDY 2\nRDY 3\n");
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundCommand>(10);
        let pending = Arc::new(AtomicUsize::new(100));
        let handle = WriterHandle::new(tx, pending, 100, Duration::from_secs(1));

        let result = handle.try_send(rdy(1));
        assert!(matches!(result, Err(NsqError::ConnectionUnavailable(_))));
        assert!(handle.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_send_after_task_stopped() {
        let (tx, rx) = mpsc::channel::<OutboundCommand>(10);
        drop(rx);
        let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)), 100, Duration::from_secs(1));

        assert!(handle.is_closed());
        assert!(matches!(handle.send(rdy(1)).await, Err(NsqError::ConnectionClosed)));
        assert!(matches!(handle.try_send(rdy(1)), Err(NsqError::ConnectionClosed)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![rdy(1), OutboundCommand::new(&Command::Cls)];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b" 1\n");

        let slices = build_remaining_slices(&batch, 6);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"CLS\n");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(rdy).collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * 6);
    }

    #[test]
    fn test_batch_names() {
        let batch = vec![rdy(1), OutboundCommand::new(&Command::Nop), rdy(0)];
        assert_eq!(batch_names(&batch), vec!["RDY", "NOP", "RDY"]);
    }

    #[tokio::test]
    async fn test_writer_stops_when_peer_gone() {
        let (client, server) = duplex(4096);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(rdy(1)).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
