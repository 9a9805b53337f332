//! Execution agent: serves commands from the host over one physical stream.
//!
//! ```text
//! host ──$command──▶ RequestCodec ─▶ Executor ─▶ ResponseCodec ──$command──▶ host
//!      ──in────────▶ ChannelInput ◀─ user code ─▶ out / err ─────────────────▶
//!      ──$stop─────▶ ExecutionGate
//! ```
//!
//! Commands are handled one at a time. User code runs on a blocking thread
//! and writes its output straight onto the multiplexer, so all output of an
//! invocation is framed before the invocation's response.

pub mod context;
pub mod executor;
pub mod gate;
pub mod loader;

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{RequestCodec, ResponseCodec};
use crate::bridge::mux::{ChannelReader, Demultiplexer, Multiplexer};
use crate::bridge::protocol::{
    COMMAND_CHANNEL, ERR_CHANNEL, IN_CHANNEL, LOG_CHANNEL, OUT_CHANNEL, Request, Response,
    STOP_CHANNEL, input_requested_channel,
};
use crate::config::ProtocolConfig;
use crate::error::ExecutionError;

pub use context::{AgentStreams, ChannelInput, InvocationContext, NoInput, OutputSink, UserInput};
pub use executor::{Executor, ExtensionHandler, PANIC_EXCEPTION_CLASS};
pub use gate::{ExecutionGate, Phase};
pub use loader::{ClassHandle, ClassLoader, LoadError, Thrown};

#[derive(Default)]
pub struct AgentOptions {
    pub protocol: ProtocolConfig,
    pub extensions: Vec<(String, Arc<dyn ExtensionHandler>)>,
    /// Encoded log lines to ship on `$log`, from [`crate::AgentTracingLayer`].
    pub logs: Option<mpsc::Receiver<Bytes>>,
}

impl AgentOptions {
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_extension(
        mut self,
        command: impl Into<String>,
        handler: Arc<dyn ExtensionHandler>,
    ) -> Self {
        self.extensions.push((command.into(), handler));
        self
    }

    pub fn with_logs(mut self, logs: mpsc::Receiver<Bytes>) -> Self {
        self.logs = Some(logs);
        self
    }
}

/// Serve the host on `stream` until it sends CLOSE or disconnects.
pub async fn run_agent<S>(
    stream: S,
    loader: Arc<dyn ClassLoader>,
    options: AgentOptions,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mux = Multiplexer::new(write_half);

    let mut demux = Demultiplexer::new();
    let command_rx = demux.route(COMMAND_CHANNEL);
    let input_rx = demux.route(IN_CHANNEL);
    let stop_rx = demux.route(STOP_CHANNEL);
    let disconnected = CancellationToken::new();
    demux.close_on_end(disconnected.clone());

    let streams = AgentStreams {
        out: Arc::new(mux.channel(OUT_CHANNEL)),
        err: Arc::new(mux.channel(ERR_CHANNEL)),
        input: Arc::new(ChannelInput::new(
            mux.channel(input_requested_channel(IN_CHANNEL)),
            input_rx,
        )),
    };
    let mut executor = Executor::new(loader, streams);
    for (command, handler) in options.extensions {
        executor
            .register_extension(command, handler)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    }
    let executor = Arc::new(executor);

    let demux_task = demux.spawn(read_half);
    let log_task = options
        .logs
        .map(|logs| mux.channel(LOG_CHANNEL).spawn_forwarder(logs));
    let stop_task = tokio::spawn(watch_stop(
        stop_rx,
        Arc::clone(executor.gate()),
        disconnected,
    ));

    tracing::info!("Agent ready");
    let result = serve_commands(&executor, command_rx, &mux, options.protocol).await;

    stop_task.abort();
    if let Some(task) = log_task {
        task.abort();
    }
    if let Err(e) = mux.shutdown().await {
        tracing::debug!(error = %e, "Shutdown of physical stream failed");
    }
    demux_task.abort();
    result
}

async fn serve_commands(
    executor: &Executor,
    command_rx: mpsc::UnboundedReceiver<Bytes>,
    mux: &Multiplexer,
    protocol: ProtocolConfig,
) -> io::Result<()> {
    let mut requests = FramedRead::new(
        ChannelReader::new(command_rx),
        RequestCodec::new(protocol),
    );
    let command = mux.channel(COMMAND_CHANNEL);
    let mut responses = ResponseCodec::new(protocol);

    loop {
        let request = match requests.next().await {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                // No request ids on the wire: after a malformed request the
                // stream cannot be resynchronised.
                tracing::error!(error = %e, "Malformed command, closing session");
                return Err(e);
            }
            None => {
                tracing::info!("Host disconnected");
                return Ok(());
            }
        };

        let closing = matches!(request, Request::Close);
        tracing::debug!(command = request.tag(), "Executing command");
        let response = executor.execute(request).await;
        let mut encoded = BytesMut::new();
        if let Err(e) = responses.encode(response, &mut encoded) {
            tracing::error!(error = %e, "Response cannot be encoded, reporting internal problem");
            encoded.clear();
            let fallback = ExecutionError::internal(format!("response cannot be encoded: {e}"));
            responses.encode(Response::Failure(fallback), &mut encoded)?;
        }
        command.write(&encoded).await?;

        if closing {
            tracing::info!("Session closed by host");
            return Ok(());
        }
    }
}

/// Any frame on `$stop` stops running user code. Disconnection stops it too.
async fn watch_stop(
    mut stop_rx: mpsc::UnboundedReceiver<Bytes>,
    gate: Arc<ExecutionGate>,
    disconnected: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = stop_rx.recv() => {
                if frame.is_none() {
                    break;
                }
                if gate.request_stop() {
                    tracing::info!("Stop requested via side channel");
                } else {
                    tracing::debug!("Side-channel stop ignored: no invocation in progress");
                }
            }
            _ = disconnected.cancelled() => break,
        }
    }
    if gate.request_stop() {
        tracing::warn!("Host gone, stopping running invocation");
    }
}
