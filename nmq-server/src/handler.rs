//! Application callbacks for connection events.

use nmq_protocol::{Message, OpCode};
use nmq_snowflake::SnowId;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Receives connection lifecycle events and complete messages.
///
/// Callbacks run on the connection's read loop, so they should return quickly;
/// anything slow belongs on a separate task.
pub trait MessageHandler: Send + Sync + 'static {
    /// Called after the connection is registered, before its first read.
    fn on_connect(&self, id: SnowId, peer: Option<SocketAddr>) {
        let _ = (id, peer);
    }

    /// Called for every complete Text or Binary message.
    fn on_message(&self, id: SnowId, opcode: OpCode, message: Message);

    /// Called once after the connection has been unregistered.
    fn on_disconnect(&self, id: SnowId) {
        let _ = id;
    }
}

/// Logs every event and drops the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn on_connect(&self, id: SnowId, peer: Option<SocketAddr>) {
        match peer {
            Some(addr) => tracing::info!("[{}] Client connected: {}", id, addr),
            None => tracing::info!("[{}] Client connected", id),
        }
    }

    fn on_message(&self, id: SnowId, opcode: OpCode, message: Message) {
        tracing::info!(
            "[{}] Message {}: {} ({} bytes)",
            id,
            message.id,
            opcode,
            message.len()
        );
    }

    fn on_disconnect(&self, id: SnowId) {
        tracing::info!("[{}] Client disconnected", id);
    }
}

/// Connection event forwarded by [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        id: SnowId,
        peer: Option<SocketAddr>,
    },
    Message {
        id: SnowId,
        opcode: OpCode,
        message: Message,
    },
    Disconnected {
        id: SnowId,
    },
}

/// Forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

impl MessageHandler for ChannelHandler {
    fn on_connect(&self, id: SnowId, peer: Option<SocketAddr>) {
        self.forward(ConnectionEvent::Connected { id, peer });
    }

    fn on_message(&self, id: SnowId, opcode: OpCode, message: Message) {
        self.forward(ConnectionEvent::Message {
            id,
            opcode,
            message,
        });
    }

    fn on_disconnect(&self, id: SnowId) {
        self.forward(ConnectionEvent::Disconnected { id });
    }
}
