//! Execution providers selected by spec string.
//!
//! | provider   | parameters                                          |
//! |------------|-----------------------------------------------------|
//! | `direct`   | none; needs an in-process class loader              |
//! | `remote`   | `remoteAgent`, `timeout`, `hostname`, `launch`, `args` |
//! | `failover` | `0(<spec>)`, `1(<spec>)`, ... tried in key order    |

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::agent::ClassLoader;
use crate::config::{AgentConfig, ExecutionSpec, SpecError};
use crate::control::ExecutionControl;
use crate::direct::DirectExecutionControl;
use crate::failover::connect_first;
use crate::io::SessionIo;
use crate::remote::RemoteExecutionControl;
use crate::supervisor::{AgentLauncher, ProcessLauncher, SupervisorError};

pub const DIRECT: &str = "direct";
pub const REMOTE: &str = "remote";
pub const FAILOVER: &str = "failover";

/// What providers draw on when building a session.
#[derive(Clone)]
pub struct ProviderEnv {
    pub io: SessionIo,
    pub launcher: Arc<dyn AgentLauncher>,
    /// Loader for the `direct` provider.
    pub loader: Option<Arc<dyn ClassLoader>>,
}

impl ProviderEnv {
    pub fn new(io: SessionIo) -> Self {
        Self {
            io,
            launcher: Arc::new(ProcessLauncher),
            loader: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn AgentLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ClassLoader>) -> Self {
        self.loader = Some(loader);
        self
    }
}

/// Build an execution control for `spec`.
pub fn generate<'a>(
    spec: &'a ExecutionSpec,
    env: &'a ProviderEnv,
) -> BoxFuture<'a, Result<Box<dyn ExecutionControl>, SupervisorError>> {
    async move {
        tracing::debug!(%spec, "Generating execution control");
        match spec.provider.as_str() {
            DIRECT => {
                if let Some((key, _)) = spec.params.first() {
                    return Err(SpecError::UnknownKey {
                        provider: spec.provider.clone(),
                        key: key.clone(),
                    }
                    .into());
                }
                let loader = env
                    .loader
                    .clone()
                    .ok_or_else(|| SpecError::MissingLoader(spec.provider.clone()))?;
                let control = DirectExecutionControl::new(loader, env.io.clone());
                Ok(Box::new(control) as Box<dyn ExecutionControl>)
            }
            REMOTE => {
                let config = AgentConfig::from_spec(spec)?;
                let control =
                    RemoteExecutionControl::connect(&config, env.launcher.as_ref(), env.io.clone())
                        .await?;
                Ok(Box::new(control) as Box<dyn ExecutionControl>)
            }
            FAILOVER => {
                let alternatives = spec.alternatives()?;
                connect_first(&alternatives, |alternative| generate(alternative, env)).await
            }
            other => Err(SpecError::UnknownProvider(other.to_string()).into()),
        }
    }
    .boxed()
}
