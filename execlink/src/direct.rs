//! In-process execution control: the agent's executor runs in the host.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::agent::{AgentStreams, ClassLoader, Executor, NoInput, UserInput};
use crate::bridge::protocol::ClassBytecodes;
use crate::control::{DebugControl, ExecutionControl};
use crate::error::ExecutionError;
use crate::io::{InputProvider, SessionIo};

/// Bridges an async [`InputProvider`] to blocking user code.
struct ProviderInput {
    provider: Arc<dyn InputProvider>,
    runtime: tokio::runtime::Handle,
}

impl UserInput for ProviderInput {
    fn read(&self) -> io::Result<Option<Bytes>> {
        let chunk = self.runtime.block_on(self.provider.read())?;
        Ok(chunk.filter(|chunk| !chunk.is_empty()))
    }
}

pub struct DirectExecutionControl {
    executor: Arc<Executor>,
    closed: AtomicBool,
}

impl DirectExecutionControl {
    /// Must be called inside a tokio runtime when `io` has an input provider.
    pub fn new(loader: Arc<dyn ClassLoader>, io: SessionIo) -> Self {
        Self::with_executor(Executor::new(loader, streams_for(io)))
    }

    pub fn with_executor(executor: Executor) -> Self {
        Self {
            executor: Arc::new(executor),
            closed: AtomicBool::new(false),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    fn ensure_open(&self) -> Result<(), ExecutionError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ExecutionError::terminated("execution control closed"))
        } else {
            Ok(())
        }
    }
}

fn streams_for(io: SessionIo) -> AgentStreams {
    let input: Arc<dyn UserInput> = match (io.input, tokio::runtime::Handle::try_current()) {
        (Some(provider), Ok(runtime)) => Arc::new(ProviderInput { provider, runtime }),
        (Some(_), Err(_)) => {
            tracing::warn!("No runtime for input provider, user input disabled");
            Arc::new(NoInput)
        }
        (None, _) => Arc::new(NoInput),
    };
    AgentStreams {
        out: Arc::new(io.out),
        err: Arc::new(io.err),
        input,
    }
}

#[async_trait]
impl ExecutionControl for DirectExecutionControl {
    async fn load(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError> {
        self.ensure_open()?;
        self.executor.load(classes)
    }

    async fn redefine(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError> {
        self.ensure_open()?;
        self.executor.redefine(classes)
    }

    async fn invoke(&self, class_name: &str, method_name: &str) -> Result<String, ExecutionError> {
        self.ensure_open()?;
        self.executor.invoke(class_name, method_name).await
    }

    async fn var_value(
        &self,
        class_name: &str,
        field_name: &str,
    ) -> Result<String, ExecutionError> {
        self.ensure_open()?;
        self.executor.var_value(class_name, field_name)
    }

    async fn add_to_classpath(&self, path: &str) -> Result<(), ExecutionError> {
        self.ensure_open()?;
        self.executor.add_to_classpath(path)
    }

    async fn stop(&self) -> Result<(), ExecutionError> {
        self.ensure_open()?;
        self.executor.gate().interrupt().await
    }

    async fn extension_command(
        &self,
        command: &str,
        argument: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        self.ensure_open()?;
        self.executor.extension_command(command, argument)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Nothing to keep running for.
            self.executor.stop();
            tracing::debug!("Direct execution control closed");
        }
    }
}
