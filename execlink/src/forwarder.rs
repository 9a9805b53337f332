//! Control-side forwarder: the host's stub for an agent on the other end of a stream.
//!
//! The command channel has no request ids, so exchanges are strictly
//! serialized: write one request, flush, read exactly one response. Any
//! transport failure during an exchange, or abandoning an exchange once its
//! request is on the wire, terminates the session for good.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::agent_tracing_layer::emit_agent_log;
use crate::bridge::codec::{RequestCodec, ResponseCodec};
use crate::bridge::mux::{ChannelReader, ChannelWriter, Demultiplexer, Multiplexer};
use crate::bridge::protocol::{
    AgentLogRecord, COMMAND_CHANNEL, ClassBytecodes, ERR_CHANNEL, IN_CHANNEL, LOG_CHANNEL,
    OUT_CHANNEL, Payload, Request, SessionId, input_requested_channel, tags,
};
use crate::config::ProtocolConfig;
use crate::control::ExecutionControl;
use crate::error::ExecutionError;
use crate::io::{InputProvider, SessionIo};

/// Longest agent log line accepted from `$log`.
const MAX_LOG_LINE: usize = 64 * 1024;

struct Exchange {
    command: ChannelWriter,
    requests: RequestCodec,
    responses: FramedRead<ChannelReader, ResponseCodec>,
}

pub struct StreamingExecutionControl {
    session: SessionId,
    mux: Multiplexer,
    exchange: tokio::sync::Mutex<Exchange>,
    /// Set once; every later call fails with this message and no I/O.
    terminated: Mutex<Option<String>>,
    disconnected: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamingExecutionControl {
    /// Start a session over `stream`. Spawns the demultiplexer, input and
    /// agent-log tasks; they end with the stream or when this value drops.
    pub fn connect<S>(stream: S, io: SessionIo, protocol: ProtocolConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = SessionId::new();
        let (read_half, write_half) = tokio::io::split(stream);
        let mux = Multiplexer::new(write_half);

        let mut demux = Demultiplexer::new();
        let command_rx = demux.route(COMMAND_CHANNEL);
        demux.route_to(OUT_CHANNEL, io.out.clone());
        demux.route_to(ERR_CHANNEL, io.err.clone());
        let input_requests = demux.route(input_requested_channel(IN_CHANNEL));
        let log_rx = demux.route(LOG_CHANNEL);
        let disconnected = CancellationToken::new();
        demux.close_on_end(disconnected.clone());

        let demux_task = tokio::spawn(async move {
            if let Err(e) = demux.run(read_half).await {
                tracing::warn!(%session, error = %e, "Agent stream failed");
            }
        });
        let input_task = tokio::spawn(serve_input(
            input_requests,
            mux.channel(IN_CHANNEL),
            io.input.clone(),
        ));
        let log_task = tokio::spawn(relay_agent_logs(log_rx));

        tracing::debug!(%session, "Session started");
        Self {
            session,
            exchange: tokio::sync::Mutex::new(Exchange {
                command: mux.channel(COMMAND_CHANNEL),
                requests: RequestCodec::new(protocol),
                responses: FramedRead::new(
                    ChannelReader::new(command_rx),
                    ResponseCodec::new(protocol),
                ),
            }),
            mux,
            terminated: Mutex::new(None),
            disconnected,
            tasks: vec![demux_task, input_task, log_task],
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Writer for a logical channel outside the command exchange.
    pub fn side_channel(&self, name: &str) -> ChannelWriter {
        self.mux.channel(name)
    }

    /// Cancelled when the agent's stream ends.
    pub fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated_message().is_some()
    }

    fn terminated_message(&self) -> Option<String> {
        self.terminated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record termination; the first message wins.
    pub(crate) fn terminate(&self, message: impl Into<String>) -> ExecutionError {
        let mut terminated = self.terminated.lock().unwrap_or_else(PoisonError::into_inner);
        let message = terminated.get_or_insert_with(|| {
            let message = message.into();
            tracing::error!(session = %self.session, %message, "Session terminated");
            message
        });
        ExecutionError::EngineTerminated(message.clone())
    }

    async fn exchange(&self, request: Request) -> Result<Payload, ExecutionError> {
        let mut guard = self.exchange.lock().await;
        if let Some(message) = self.terminated_message() {
            return Err(ExecutionError::EngineTerminated(message));
        }
        let exchange = &mut *guard;

        let tag = request.tag().to_string();
        // Nothing has been written yet, so the session is still in step.
        let mut encoded = BytesMut::new();
        if let Err(e) = exchange.requests.encode(request, &mut encoded) {
            return Err(ExecutionError::internal(format!("cannot encode {tag}: {e}")));
        }

        let mut in_flight = InFlight {
            control: self,
            tag: &tag,
            settled: false,
        };
        tracing::debug!(session = %self.session, command = %tag, "Sending command");
        if let Err(e) = exchange.command.write(&encoded).await {
            in_flight.settled = true;
            return Err(self.terminate(format!("failed to send {tag}: {e}")));
        }

        let response = exchange.responses.next().await;
        in_flight.settled = true;
        match response {
            Some(Ok(response)) => match response.into_result() {
                Err(ExecutionError::EngineTerminated(message)) => Err(self.terminate(message)),
                result => result,
            },
            Some(Err(e)) => Err(self.terminate(format!("malformed response to {tag}: {e}"))),
            None => Err(self.terminate(format!("agent connection lost during {tag}"))),
        }
    }
}

/// Terminates the session if an exchange is dropped between sending its
/// request and reading its response: the response would otherwise be read
/// by the next caller.
struct InFlight<'a> {
    control: &'a StreamingExecutionControl,
    tag: &'a str,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.control
                .terminate(format!("{} abandoned before its response arrived", self.tag));
        }
    }
}

impl Drop for StreamingExecutionControl {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl ExecutionControl for StreamingExecutionControl {
    async fn load(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError> {
        self.exchange(Request::Load(classes.to_vec())).await?;
        Ok(())
    }

    async fn redefine(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError> {
        self.exchange(Request::Redefine(classes.to_vec())).await?;
        Ok(())
    }

    async fn invoke(&self, class_name: &str, method_name: &str) -> Result<String, ExecutionError> {
        let payload = self
            .exchange(Request::Invoke {
                class_name: class_name.to_string(),
                method_name: method_name.to_string(),
            })
            .await?;
        Ok(payload.into_text())
    }

    async fn var_value(
        &self,
        class_name: &str,
        field_name: &str,
    ) -> Result<String, ExecutionError> {
        let payload = self
            .exchange(Request::VarValue {
                class_name: class_name.to_string(),
                field_name: field_name.to_string(),
            })
            .await?;
        Ok(payload.into_text())
    }

    async fn add_to_classpath(&self, path: &str) -> Result<(), ExecutionError> {
        self.exchange(Request::AddClasspath(path.to_string()))
            .await?;
        Ok(())
    }

    /// Queued behind any in-flight command, so it only reaches the agent
    /// between invocations. Use the `$stop` side channel to interrupt.
    async fn stop(&self) -> Result<(), ExecutionError> {
        self.exchange(Request::Stop).await?;
        Ok(())
    }

    async fn extension_command(
        &self,
        command: &str,
        argument: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        if tags::is_builtin(command) {
            return Err(ExecutionError::internal(format!(
                "extension {command} collides with a built-in command"
            )));
        }
        let payload = self
            .exchange(Request::Extension {
                command: command.to_string(),
                argument,
            })
            .await?;
        Ok(payload.into_json())
    }

    async fn close(&self) {
        if self.is_terminated() {
            return;
        }
        if let Err(e) = self.exchange(Request::Close).await {
            tracing::debug!(session = %self.session, error = %e, "Close not acknowledged");
        }
        self.terminate("execution control closed");
        if let Err(e) = self.mux.shutdown().await {
            tracing::debug!(session = %self.session, error = %e, "Stream shutdown failed");
        }
    }
}

/// Answer each agent input request with one chunk from `provider`.
/// No provider, or provider end of input, answers with an empty frame.
async fn serve_input(
    mut requests: mpsc::UnboundedReceiver<Bytes>,
    input: ChannelWriter,
    provider: Option<std::sync::Arc<dyn InputProvider>>,
) {
    while requests.recv().await.is_some() {
        let chunk = match &provider {
            Some(provider) => match provider.read().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => Bytes::new(),
                Err(e) => {
                    tracing::warn!(error = %e, "Input provider failed, sending end of input");
                    Bytes::new()
                }
            },
            None => Bytes::new(),
        };
        if let Err(e) = input.write(&chunk).await {
            tracing::debug!(error = %e, "Input channel closed");
            break;
        }
    }
}

async fn relay_agent_logs(log_rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut lines = FramedRead::new(
        ChannelReader::new(log_rx),
        LinesCodec::new_with_max_length(MAX_LOG_LINE),
    );
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => match serde_json::from_str::<AgentLogRecord>(&line) {
                Ok(record) => emit_agent_log(&record),
                Err(e) => tracing::debug!(error = %e, "Unparseable agent log line"),
            },
            Err(e) => {
                tracing::debug!(error = %e, "Agent log channel failed");
                break;
            }
        }
    }
}
