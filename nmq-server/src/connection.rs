//! Write side of a live connection.

use crate::error::ServerError;
use bytes::BytesMut;
use nmq_protocol::{Frame, OpCode};
use nmq_snowflake::SnowId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

/// Upper bound on shutting down the write half during teardown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Boxed read half handed to the connection's read loop.
pub type ConnectionReader = Box<dyn AsyncRead + Send + Unpin>;

type ConnectionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to a live connection, shared between the registry and its read loop.
///
/// The stream is split on construction: the write half stays here behind an
/// async mutex so any task can send frames, the read half goes to the read loop.
pub struct ConnectionHandle {
    id: SnowId,
    peer: Option<SocketAddr>,
    writer: Mutex<ConnectionWriter>,
    closed: AtomicBool,
    close_notify: Notify,
    bytes_sent: AtomicU64,
}

impl ConnectionHandle {
    /// Wraps `stream` and returns the handle together with the read half.
    pub fn new<S>(id: SnowId, peer: Option<SocketAddr>, stream: S) -> (Self, ConnectionReader)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let handle = Self {
            id,
            peer,
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            bytes_sent: AtomicU64::new(0),
        };
        (handle, Box::new(reader))
    }

    pub fn id(&self) -> SnowId {
        self.id
    }

    /// Remote address, if the stream has one.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Sends one final, unmasked frame.
    pub async fn send(&self, opcode: OpCode, payload: &[u8]) -> Result<(), ServerError> {
        let mut buf = BytesMut::new();
        Frame::new(opcode, bytes::Bytes::copy_from_slice(payload)).encode_into(&mut buf);
        self.send_raw(&buf).await
    }

    /// Writes already-encoded frame bytes.
    ///
    /// A write stuck on a peer that stops reading is abandoned with
    /// [`ServerError::ConnectionClosed`] as soon as the connection is closed.
    pub async fn send_raw(&self, data: &[u8]) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed() => Err(ServerError::ConnectionClosed),
            result = self.write_locked(data) => result,
        }
    }

    async fn write_locked(&self, data: &[u8]) -> Result<(), ServerError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        self.bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Marks the connection closed and wakes its read loop.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_notify.notify_waiters();
        true
    }

    /// Resolves once [`ConnectionHandle::close`] has been called.
    ///
    /// Any number of tasks may wait; all of them wake on close.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent close is not missed
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Shuts down the write half so the peer sees EOF.
    ///
    /// Gives up after a short bound if the writer is wedged behind a peer
    /// that stopped reading.
    pub(crate) async fn shutdown_writer(&self) {
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("[{}] Shutdown error: {}", self.id, e),
            Err(_) => tracing::debug!("[{}] Shutdown timed out", self.id),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}
