//! Connection management.

use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use nmq_protocol::{
    Decoder, Frame, MessageAssembler, OpCode, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_PORT,
};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long [`Connection::recv_frame`] waits for a frame.
    pub read_timeout: Duration,
    /// Largest frame payload accepted from the server.
    pub max_frame_size: usize,
    /// Largest message [`Connection::recv_message`] will assemble.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
    }
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

/// A connection to an nmq server.
///
/// Every frame sent is masked with a fresh random key. Frames from the server
/// are read one at a time with [`Connection::recv_frame`].
pub struct Connection<S = TcpStream> {
    config: ClientConfig,
    /// Write half of the stream.
    writer: Mutex<Option<WriteHalf<S>>>,
    /// Read half of the stream.
    reader: Mutex<Option<ReadHalf<S>>>,
    /// Decoder for frames from the server.
    decoder: Mutex<Decoder>,
    connected: AtomicBool,
}

impl Connection<TcpStream> {
    /// Connects to the server.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let tcp_stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })?
            .map_err(|e| {
                tracing::debug!("Connection failed: {}", e);
                ClientError::Io(e)
            })?;

        tcp_stream.set_nodelay(true).ok();
        tracing::debug!("Connected to {}", config.addr);

        Ok(Self::from_stream(tcp_stream, config))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Wraps an already-connected stream.
    pub fn from_stream(stream: S, config: ClientConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            decoder: Mutex::new(Decoder::with_max_frame_size(config.max_frame_size)),
            config,
            writer: Mutex::new(Some(write_half)),
            reader: Mutex::new(Some(read_half)),
            connected: AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends a Binary message in one frame.
    pub async fn send_binary(&self, data: &[u8]) -> Result<(), ClientError> {
        self.send(OpCode::Binary, data).await
    }

    /// Sends a Text message in one frame.
    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        self.send(OpCode::Text, text.as_bytes()).await
    }

    /// Sends a Ping; the server answers with a Pong carrying the same payload.
    pub async fn ping(&self, payload: &[u8]) -> Result<(), ClientError> {
        self.send(OpCode::Ping, payload).await
    }

    /// Sends one final frame with `opcode`.
    pub async fn send(&self, opcode: OpCode, payload: &[u8]) -> Result<(), ClientError> {
        let frame = Frame::new(opcode, Bytes::copy_from_slice(payload));
        self.write_frames(&[frame]).await
    }

    /// Sends one message split across several frames.
    ///
    /// The first frame carries `opcode`, the rest are Continuation frames and
    /// only the last has FIN set.
    pub async fn send_fragments(&self, opcode: OpCode, parts: &[&[u8]]) -> Result<(), ClientError> {
        let last = parts.len().saturating_sub(1);
        let frames: Vec<Frame> = parts
            .iter()
            .enumerate()
            .map(|(i, part)| {
                let op = if i == 0 { opcode } else { OpCode::Continuation };
                Frame::new(op, Bytes::copy_from_slice(part)).with_fin(i == last)
            })
            .collect();
        self.write_frames(&frames).await
    }

    /// Writes raw bytes to the stream, bypassing framing.
    ///
    /// Fails with [`ClientError::ConnectionClosed`] once [`Connection::close`]
    /// has run.
    pub async fn send_raw(&self, data: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::ConnectionClosed)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn write_frames(&self, frames: &[Frame]) -> Result<(), ClientError> {
        let mut buf = BytesMut::new();
        {
            let mut rng = rand::thread_rng();
            for frame in frames {
                let key = rng.gen::<u32>().to_be_bytes();
                frame.clone().with_mask(key).encode_into(&mut buf);
            }
        }
        tracing::trace!("Sending {} frame(s), {} bytes", frames.len(), buf.len());
        self.send_raw(&buf).await
    }

    /// Receives the next frame from the server.
    ///
    /// Returns `Ok(None)` when the server closed the stream, and
    /// [`ClientError::Timeout`] if no frame arrives within the read timeout.
    pub async fn recv_frame(&self) -> Result<Option<Frame>, ClientError> {
        let mut decoder = self.decoder.lock().await;
        if let Some(frame) = decoder.decode_frame()? {
            return Ok(Some(frame));
        }

        let mut reader_guard = self.reader.lock().await;
        let reader = reader_guard.as_mut().ok_or(ClientError::ConnectionClosed)?;

        let frame = tokio::time::timeout(
            self.config.read_timeout,
            read_frame(reader, &mut decoder),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        if frame.is_none() {
            tracing::debug!("Connection closed by server");
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(frame)
    }

    /// Receives frames until a Text or Binary message is complete, skipping
    /// Pongs. Returns `Ok(None)` on Close or EOF.
    pub async fn recv_message(&self) -> Result<Option<(OpCode, Bytes)>, ClientError> {
        let mut assembler = MessageAssembler::new(self.config.max_message_size);
        loop {
            let frame = match self.recv_frame().await? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            match frame.opcode() {
                OpCode::Close => return Ok(None),
                OpCode::Ping | OpCode::Pong => continue,
                _ => {
                    if let Some(message) = assembler.push(frame)? {
                        return Ok(Some(message));
                    }
                }
            }
        }
    }

    /// Sends a Close frame, waits for the server's Close (or EOF) and shuts the
    /// stream down.
    pub async fn close(&self) -> Result<(), ClientError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }

        self.send(OpCode::Close, &[]).await?;

        loop {
            match self.recv_frame().await {
                Ok(Some(frame)) if frame.opcode() == OpCode::Close => break,
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(ClientError::Timeout) => {
                    tracing::debug!("No close reply from server");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        self.reader.lock().await.take();
        Ok(())
    }
}

/// Reads until one frame is decoded or the stream ends.
async fn read_frame<R>(reader: &mut R, decoder: &mut Decoder) -> Result<Option<Frame>, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        decoder.extend(&buf[..n]);
        if let Some(frame) = decoder.decode_frame()? {
            return Ok(Some(frame));
        }
    }
}
