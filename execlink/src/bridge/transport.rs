//! TCP transport between host and agent.
//!
//! The host binds a listener and hands the agent an [`AgentAddress`], either on
//! the command line (`--connect host:port`) or in the environment
//! (`EXECLINK_AGENT_ADDR`). The agent connects back; the accepted stream is the
//! physical stream for the multiplexer.

use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

/// Environment variable a launched agent reads its host address from.
pub const AGENT_ADDR_ENV: &str = "EXECLINK_AGENT_ADDR";

/// Where the agent should connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAddress {
    pub host: String,
    pub port: u16,
}

impl AgentAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for AgentAddress {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("expected host:port, got {s:?}"),
            )
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(bad)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse().map_err(|_| bad())?;
        Ok(Self::new(host, port))
    }
}

/// Host-side listener the agent connects to. Closed on drop.
pub struct HostListener {
    listener: TcpListener,
    address: AgentAddress,
}

impl HostListener {
    /// Bind an ephemeral port on `host`.
    pub async fn bind(host: &str) -> io::Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let port = listener.local_addr()?.port();
        tracing::debug!(host, port, "Bound agent listener");
        Ok(Self {
            listener,
            address: AgentAddress::new(host, port),
        })
    }

    /// Bind on `host`, falling back to loopback when that host is unusable.
    pub async fn bind_with_fallback(host: &str) -> io::Result<Self> {
        match Self::bind(host).await {
            Ok(listener) => Ok(listener),
            Err(e) => {
                tracing::warn!(host, error = %e, "Cannot listen on host, falling back to loopback");
                Self::bind("127.0.0.1").await
            }
        }
    }

    pub fn address(&self) -> &AgentAddress {
        &self.address
    }

    pub async fn accept(&self) -> io::Result<TcpStream> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%peer, "Agent connected");
        Ok(stream)
    }
}

/// Agent side: connect to the host.
pub async fn connect(address: &AgentAddress) -> io::Result<TcpStream> {
    tracing::debug!(%address, "Connecting to host");
    let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
