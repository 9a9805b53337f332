//! The execution-control capability consumed by an interactive shell.
//!
//! Variants:
//! - [`DirectExecutionControl`](crate::direct::DirectExecutionControl): in-process agent
//! - [`StreamingExecutionControl`](crate::forwarder::StreamingExecutionControl): agent over a stream
//! - [`RemoteExecutionControl`](crate::remote::RemoteExecutionControl): supervised agent
//!   process with a stop side channel

use async_trait::async_trait;

use crate::bridge::protocol::ClassBytecodes;
use crate::error::ExecutionError;

#[async_trait]
pub trait ExecutionControl: Send + Sync {
    /// Install classes. Partial failure reports per-class flags in
    /// [`ExecutionError::ClassInstall`].
    async fn load(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError>;

    async fn redefine(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError>;

    /// Run a static entry point and return its rendered result.
    async fn invoke(&self, class_name: &str, method_name: &str) -> Result<String, ExecutionError>;

    /// Rendered value of a static field.
    async fn var_value(&self, class_name: &str, field_name: &str)
    -> Result<String, ExecutionError>;

    async fn add_to_classpath(&self, path: &str) -> Result<(), ExecutionError>;

    /// Stop a running invocation. A no-op when nothing is running.
    async fn stop(&self) -> Result<(), ExecutionError>;

    async fn extension_command(
        &self,
        command: &str,
        argument: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError>;

    /// End the session. Later calls fail with `EngineTerminated`.
    async fn close(&self);
}

/// Debug-level interrupt of running user code, independent of the command
/// channel.
#[async_trait]
pub trait DebugControl: Send + Sync {
    async fn interrupt(&self) -> Result<(), ExecutionError>;
}

#[async_trait]
impl DebugControl for crate::agent::ExecutionGate {
    async fn interrupt(&self) -> Result<(), ExecutionError> {
        self.request_stop();
        Ok(())
    }
}
