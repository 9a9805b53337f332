//! Host-side standard streams for a session.
//!
//! User output arrives as byte chunks on `out`/`err`; input requests are
//! answered by an [`InputProvider`].

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Supplies user input on request. `Ok(None)` is end of input.
#[async_trait]
pub trait InputProvider: Send + Sync {
    async fn read(&self) -> io::Result<Option<Bytes>>;
}

/// Reads the host process's stdin.
pub struct StdinInput {
    stdin: tokio::sync::Mutex<tokio::io::Stdin>,
}

impl StdinInput {
    pub fn new() -> Self {
        Self {
            stdin: tokio::sync::Mutex::new(tokio::io::stdin()),
        }
    }
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputProvider for StdinInput {
    async fn read(&self) -> io::Result<Option<Bytes>> {
        let mut stdin = self.stdin.lock().await;
        let mut buf = vec![0u8; 4096];
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

/// Hands out preset chunks, then end of input.
#[derive(Default)]
pub struct ScriptedInput {
    chunks: Mutex<VecDeque<Bytes>>,
}

impl ScriptedInput {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: Mutex::new(chunks.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl InputProvider for ScriptedInput {
    async fn read(&self) -> io::Result<Option<Bytes>> {
        Ok(self
            .chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front())
    }
}

/// Streams a session delivers user output to and takes input from.
#[derive(Clone)]
pub struct SessionIo {
    pub out: mpsc::UnboundedSender<Bytes>,
    pub err: mpsc::UnboundedSender<Bytes>,
    /// No provider means user code always sees end of input.
    pub input: Option<Arc<dyn InputProvider>>,
}

impl SessionIo {
    /// Copy output to this process's stdout/stderr and read input from stdin.
    ///
    /// Must be called inside a tokio runtime.
    pub fn inherit() -> Self {
        let (out, out_rx) = mpsc::unbounded_channel();
        let (err, err_rx) = mpsc::unbounded_channel();
        tokio::spawn(copy_to(out_rx, tokio::io::stdout()));
        tokio::spawn(copy_to(err_rx, tokio::io::stderr()));
        Self {
            out,
            err,
            input: Some(Arc::new(StdinInput::new())),
        }
    }

    /// Collect output in memory.
    pub fn capture() -> (Self, CapturedOutput) {
        let (out, out_rx) = mpsc::unbounded_channel();
        let (err, err_rx) = mpsc::unbounded_channel();
        let io = Self {
            out,
            err,
            input: None,
        };
        (
            io,
            CapturedOutput {
                out: out_rx,
                err: err_rx,
            },
        )
    }

    pub fn with_input(mut self, input: Arc<dyn InputProvider>) -> Self {
        self.input = Some(input);
        self
    }
}

async fn copy_to<W>(mut rx: mpsc::UnboundedReceiver<Bytes>, mut dst: W)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        if dst.write_all(&chunk).await.is_err() || dst.flush().await.is_err() {
            break;
        }
    }
}

/// Receiving side of [`SessionIo::capture`].
pub struct CapturedOutput {
    pub out: mpsc::UnboundedReceiver<Bytes>,
    pub err: mpsc::UnboundedReceiver<Bytes>,
}

impl CapturedOutput {
    /// Everything written to `out` so far.
    pub fn take_out(&mut self) -> String {
        drain(&mut self.out)
    }

    /// Everything written to `err` so far.
    pub fn take_err(&mut self) -> String {
        drain(&mut self.err)
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> String {
    let mut collected = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        collected.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&collected).into_owned()
}
