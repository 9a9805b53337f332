//! Debug-attached variant: a supervised agent process plus a forwarder.
//!
//! `stop` bypasses the command exchange and goes out on `$stop`, so it
//! reaches an agent that is busy with an invoke.

use async_trait::async_trait;

use crate::bridge::mux::ChannelWriter;
use crate::bridge::protocol::{ClassBytecodes, STOP_CHANNEL, SessionId};
use crate::config::AgentConfig;
use crate::control::{DebugControl, ExecutionControl};
use crate::error::ExecutionError;
use crate::forwarder::StreamingExecutionControl;
use crate::io::SessionIo;
use crate::supervisor::{AgentLauncher, AgentProcess, SupervisorError, establish};

/// Writes one byte on the agent's stop channel per interrupt.
pub struct StopChannel {
    writer: ChannelWriter,
}

impl StopChannel {
    pub fn new(writer: ChannelWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl DebugControl for StopChannel {
    async fn interrupt(&self) -> Result<(), ExecutionError> {
        self.writer
            .write(&[1])
            .await
            .map_err(|e| ExecutionError::terminated(format!("stop channel closed: {e}")))
    }
}

pub struct RemoteExecutionControl {
    forwarder: StreamingExecutionControl,
    stop: StopChannel,
    process: AgentProcess,
}

impl RemoteExecutionControl {
    /// Launch an agent per `config` and open a session on its connection.
    pub async fn connect(
        config: &AgentConfig,
        launcher: &dyn AgentLauncher,
        io: SessionIo,
    ) -> Result<Self, SupervisorError> {
        let (stream, process) = establish(config, launcher).await?;
        let forwarder = StreamingExecutionControl::connect(stream, io, config.protocol);
        let stop = StopChannel::new(forwarder.side_channel(STOP_CHANNEL));
        tracing::info!(session = %forwarder.session_id(), pid = ?process.id(), "Remote session ready");
        Ok(Self {
            forwarder,
            stop,
            process,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.forwarder.session_id()
    }

    pub fn process(&self) -> &AgentProcess {
        &self.process
    }
}

#[async_trait]
impl ExecutionControl for RemoteExecutionControl {
    async fn load(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError> {
        self.forwarder.load(classes).await
    }

    async fn redefine(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError> {
        self.forwarder.redefine(classes).await
    }

    async fn invoke(&self, class_name: &str, method_name: &str) -> Result<String, ExecutionError> {
        self.forwarder.invoke(class_name, method_name).await
    }

    async fn var_value(
        &self,
        class_name: &str,
        field_name: &str,
    ) -> Result<String, ExecutionError> {
        self.forwarder.var_value(class_name, field_name).await
    }

    async fn add_to_classpath(&self, path: &str) -> Result<(), ExecutionError> {
        self.forwarder.add_to_classpath(path).await
    }

    async fn stop(&self) -> Result<(), ExecutionError> {
        if self.forwarder.is_terminated() {
            return Err(self.forwarder.terminate("session terminated"));
        }
        match self.stop.interrupt().await {
            Ok(()) => Ok(()),
            Err(ExecutionError::EngineTerminated(message)) => Err(self.forwarder.terminate(message)),
            Err(e) => Err(e),
        }
    }

    async fn extension_command(
        &self,
        command: &str,
        argument: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        self.forwarder.extension_command(command, argument).await
    }

    async fn close(&self) {
        self.forwarder.close().await;
        self.process.terminate().await;
        tracing::debug!(session = %self.session_id(), "Remote session closed");
    }
}
