//! Session configuration.
//!
//! - [`ProtocolConfig`]: wire-level policy shared by both codec sides
//! - [`AgentConfig`]: how the supervisor starts and reaches a remote agent
//! - [`ExecutionSpec`]: textual provider selection, `name[:key(value),...]`

use std::str::FromStr;
use std::time::Duration;

/// Remote agent program started when none is configured.
pub const DEFAULT_REMOTE_AGENT: &str = "execlink-agent";

/// Default connection timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Extra allowance on top of the nominal connect timeout, so the agent's
/// own startup and connect handshake are not cut off at the boundary.
pub const TIMEOUT_SCALE: f64 = 1.25;

/// Default cap on transmitted string length, in chars.
///
/// 21844 chars of worst-case three-byte UTF-8 stays under a 65535 byte
/// string limit that legacy transports impose.
pub const DEFAULT_MAX_STRING_CHARS: usize = 21844;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Longer strings are truncated, not rejected. `None` disables truncation.
    pub max_string_chars: Option<usize>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_string_chars: Some(DEFAULT_MAX_STRING_CHARS),
        }
    }
}

impl ProtocolConfig {
    pub fn unlimited() -> Self {
        Self {
            max_string_chars: None,
        }
    }

    pub fn with_max_string_chars(mut self, max: Option<usize>) -> Self {
        self.max_string_chars = max;
        self
    }
}

/// How the agent process and the host find each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// The agent is launched with the host address in its environment and
    /// connects back from its own startup code.
    Launch,
    /// The host listens, starts the agent with explicit `--connect` arguments
    /// and accepts its connection.
    #[default]
    Listen,
}

impl LaunchMode {
    pub fn from_launch_flag(launch: bool) -> Self {
        if launch { Self::Launch } else { Self::Listen }
    }
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch => write!(f, "launch"),
            Self::Listen => write!(f, "listen"),
        }
    }
}

/// Configuration for one supervised agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Program started as the agent.
    pub remote_agent: String,
    pub timeout: Duration,
    /// Address the host listens on; the agent connects to it.
    pub host: String,
    pub mode: LaunchMode,
    /// Extra arguments passed to the agent program.
    pub agent_args: Vec<String>,
    pub protocol: ProtocolConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTE_AGENT)
    }
}

impl AgentConfig {
    pub fn new(remote_agent: impl Into<String>) -> Self {
        Self {
            remote_agent: remote_agent.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            host: default_host(),
            mode: LaunchMode::default(),
            agent_args: Vec::new(),
            protocol: ProtocolConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_agent_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Deadline actually applied to connection establishment.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.mul_f64(TIMEOUT_SCALE)
    }

    /// Build from the parameters of a `remote` execution spec.
    pub fn from_spec(spec: &ExecutionSpec) -> Result<Self, SpecError> {
        let mut config = Self::default();
        for (key, value) in &spec.params {
            match key.as_str() {
                "remoteAgent" => config.remote_agent = value.clone(),
                "timeout" => {
                    let millis: u64 = value.trim().parse().map_err(|_| SpecError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                        reason: "expected milliseconds".to_string(),
                    })?;
                    config.timeout = Duration::from_millis(millis);
                }
                "hostname" => config.host = value.trim().to_string(),
                "launch" => {
                    let launch: bool = value.trim().parse().map_err(|_| SpecError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                        reason: "expected true or false".to_string(),
                    })?;
                    config.mode = LaunchMode::from_launch_flag(launch);
                }
                "args" => {
                    config.agent_args = value.split_whitespace().map(str::to_string).collect();
                }
                _ => {
                    return Err(SpecError::UnknownKey {
                        provider: spec.provider.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(config)
    }
}

/// Local host name, or `localhost` when it cannot be determined.
pub fn default_host() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    #[cfg(not(unix))]
    {
        "localhost".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("empty execution spec")]
    Empty,
    #[error("malformed execution spec {spec:?}: {reason}")]
    Malformed { spec: String, reason: String },
    #[error("unknown execution provider: {0}")]
    UnknownProvider(String),
    #[error("unknown parameter {key:?} for provider {provider}")]
    UnknownKey { provider: String, key: String },
    #[error("duplicate parameter {0:?}")]
    DuplicateKey(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("provider {0} requires an in-process class loader")]
    MissingLoader(String),
    #[error("failover spec has no alternatives")]
    NoAlternatives,
}

/// Parsed provider selection, e.g. `remote:launch(true),timeout(3000)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSpec {
    pub provider: String,
    /// Parameters in the order written.
    pub params: Vec<(String, String)>,
}

impl ExecutionSpec {
    pub fn parse(spec: &str) -> Result<Self, SpecError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(SpecError::Empty);
        }

        let (provider, rest) = match spec.split_once(':') {
            Some((provider, rest)) => (provider.trim(), Some(rest)),
            None => (spec, None),
        };
        if provider.is_empty()
            || !provider
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SpecError::Malformed {
                spec: spec.to_string(),
                reason: "invalid provider name".to_string(),
            });
        }

        let params = match rest {
            Some(rest) => parse_params(spec, rest)?,
            None => Vec::new(),
        };
        Ok(Self {
            provider: provider.to_string(),
            params,
        })
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Failover alternatives, ordered by their numeric keys.
    pub fn alternatives(&self) -> Result<Vec<ExecutionSpec>, SpecError> {
        let mut numbered = Vec::with_capacity(self.params.len());
        for (key, value) in &self.params {
            let index: u32 = key.parse().map_err(|_| SpecError::UnknownKey {
                provider: self.provider.clone(),
                key: key.clone(),
            })?;
            numbered.push((index, ExecutionSpec::parse(value)?));
        }
        if numbered.is_empty() {
            return Err(SpecError::NoAlternatives);
        }
        numbered.sort_by_key(|(index, _)| *index);
        Ok(numbered.into_iter().map(|(_, spec)| spec).collect())
    }
}

impl FromStr for ExecutionSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ExecutionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.provider)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { ':' } else { ',' };
            write!(f, "{sep}{key}({value})")?;
        }
        Ok(())
    }
}

/// Parse `key(value),key(value)`; values may nest balanced parentheses.
fn parse_params(spec: &str, src: &str) -> Result<Vec<(String, String)>, SpecError> {
    let malformed = |reason: &str| SpecError::Malformed {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let bytes = src.as_bytes();
    let mut params: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let open = src[pos..]
            .find('(')
            .map(|i| pos + i)
            .ok_or_else(|| malformed("parameter without value"))?;
        let key = src[pos..open].trim();
        if key.is_empty() || key.contains([',', ')']) {
            return Err(malformed("missing parameter name"));
        }

        let mut depth = 0usize;
        let mut close = None;
        for (i, b) in bytes.iter().enumerate().skip(open) {
            match b {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close.ok_or_else(|| malformed("unbalanced parentheses"))?;

        if params.iter().any(|(k, _)| k == key) {
            return Err(SpecError::DuplicateKey(key.to_string()));
        }
        params.push((key.to_string(), src[open + 1..close].to_string()));

        pos = close + 1;
        match bytes.get(pos) {
            None => break,
            Some(b',') => {
                pos += 1;
                if pos >= bytes.len() {
                    return Err(malformed("trailing comma"));
                }
            }
            Some(_) => return Err(malformed("expected ',' between parameters")),
        }
    }

    Ok(params)
}
