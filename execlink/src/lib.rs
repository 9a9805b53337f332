//! execlink: remote execution control over one multiplexed stream.

mod agent_tracing_layer;

pub mod agent;
pub mod bridge;
pub mod config;
pub mod control;
pub mod direct;
pub mod error;
pub mod failover;
pub mod forwarder;
pub mod io;
pub mod provider;
pub mod remote;
pub mod supervisor;
pub mod value;

pub use agent::{AgentOptions, ClassHandle, ClassLoader, Executor, Thrown, run_agent};
pub use agent_tracing_layer::{AgentTracingLayer, LOG_QUEUE_DEPTH, emit_agent_log};
pub use config::{AgentConfig, ExecutionSpec, LaunchMode, ProtocolConfig, SpecError};
pub use control::{DebugControl, ExecutionControl};
pub use direct::DirectExecutionControl;
pub use error::{ExecutionError, ResolutionException, UserException};
pub use forwarder::StreamingExecutionControl;
pub use io::{InputProvider, SessionIo};
pub use provider::{ProviderEnv, generate};
pub use remote::RemoteExecutionControl;
pub use supervisor::{AgentLauncher, AgentProcess, ProcessLauncher, SpawnError, SupervisorError};
pub use value::Value;
