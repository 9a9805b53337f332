//! Logical channels over one physical stream.
//!
//! - **Multiplexer / ChannelWriter**: one logical write becomes a burst of
//!   frames of at most 127 bytes, written under a stream-wide lock and flushed.
//! - **Demultiplexer**: background task that reads frames and routes each
//!   payload to the queue registered for its channel name.
//! - **ChannelReader**: AsyncRead over a routed queue, so codecs can sit on a
//!   logical channel exactly as they would on a socket.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::frame::{Frame, FrameCodec, MAX_FRAME_PAYLOAD};

type PhysicalWrite = Box<dyn AsyncWrite + Send + Unpin>;
type PhysicalSink = Arc<Mutex<FramedWrite<PhysicalWrite, FrameCodec>>>;

/// Shared writer side of a physical stream.
#[derive(Clone)]
pub struct Multiplexer {
    sink: PhysicalSink,
}

impl Multiplexer {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: PhysicalWrite = Box::new(writer);
        Self {
            sink: Arc::new(Mutex::new(FramedWrite::new(writer, FrameCodec::new()))),
        }
    }

    /// Writer for logical channel `name`. Channels need no registration.
    pub fn channel(&self, name: impl Into<String>) -> ChannelWriter {
        ChannelWriter {
            name: Arc::from(name.into()),
            sink: Arc::clone(&self.sink),
        }
    }

    /// Flush and shut down the physical writer.
    pub async fn shutdown(&self) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.flush().await?;
        sink.get_mut().shutdown().await
    }
}

/// Writes to one logical channel.
#[derive(Clone)]
pub struct ChannelWriter {
    name: Arc<str>,
    sink: PhysicalSink,
}

impl ChannelWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write `data` as one atomic burst of frames, then flush.
    ///
    /// An empty write emits a single zero-length frame (used as an
    /// end-of-input marker on input channels).
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        if data.is_empty() {
            sink.feed(Frame::new(self.name.to_string(), Bytes::new()))
                .await?;
        }
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            sink.feed(Frame::new(self.name.to_string(), Bytes::copy_from_slice(chunk)))
                .await?;
        }
        sink.flush().await
    }

    /// Encode `item` with `codec` and write it as one burst.
    pub async fn send<T, C>(&self, codec: &mut C, item: T) -> io::Result<()>
    where
        C: Encoder<T, Error = io::Error>,
    {
        let mut buf = BytesMut::new();
        codec.encode(item, &mut buf)?;
        self.write(&buf).await
    }

    /// Blocking variant for code running on a blocking thread (user code).
    ///
    /// Must not be called from inside an async task.
    pub fn write_blocking(&self, data: &[u8]) -> io::Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| io::Error::other(format!("no runtime for channel write: {e}")))?;
        handle.block_on(self.write(data))
    }

    /// Drain `rx` into this channel until the queue closes or a write fails.
    pub fn spawn_forwarder(self, mut rx: mpsc::Receiver<Bytes>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = self.write(&data).await {
                    tracing::debug!(channel = %self.name, error = %e, "Channel forwarder write failed");
                    break;
                }
            }
            tracing::trace!(channel = %self.name, "Channel forwarder exiting");
        })
    }
}

/// Routes frames from a physical stream to per-channel queues.
#[derive(Default)]
pub struct Demultiplexer {
    routes: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    close_on_end: Vec<CancellationToken>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register channel `name` and return the queue its payloads land in.
    pub fn route(&mut self, name: impl Into<String>) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.route_to(name, tx);
        rx
    }

    pub fn route_to(&mut self, name: impl Into<String>, tx: mpsc::UnboundedSender<Bytes>) {
        self.routes.insert(name.into(), tx);
    }

    /// Cancel `token` when the physical stream ends or fails.
    pub fn close_on_end(&mut self, token: CancellationToken) {
        self.close_on_end.push(token);
    }

    pub fn spawn<R>(self, reader: R) -> JoinHandle<io::Result<()>>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(self.run(reader))
    }

    /// Read frames until end of stream. All routed queues are closed on exit.
    pub async fn run<R>(mut self, reader: R) -> io::Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::new());
        let result = loop {
            match frames.next().await {
                Some(Ok(frame)) => self.dispatch(frame),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Demultiplexer read failed");
                    break Err(e);
                }
                None => {
                    tracing::debug!("Physical stream ended");
                    break Ok(());
                }
            }
        };

        self.routes.clear();
        for token in self.close_on_end.drain(..) {
            token.cancel();
        }
        result
    }

    fn dispatch(&mut self, frame: Frame) {
        let Frame { channel, payload } = frame;
        match self.routes.get(&channel) {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    tracing::debug!(%channel, "Channel receiver gone, unregistering");
                    self.routes.remove(&channel);
                }
            }
            None => {
                tracing::warn!(%channel, len = payload.len(), "Dropping frame for unregistered channel");
            }
        }
    }
}

/// Byte stream view of a routed channel queue. EOF when the queue closes.
pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

impl ChannelReader {
    pub fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}
