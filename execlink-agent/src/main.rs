//! execlink-agent
//!
//! Connects back to the host that launched it and serves execution commands
//! until the host closes the session. Classes are JSON descriptors (see
//! [`descriptor`]).

mod descriptor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use execlink::bridge::transport::{AGENT_ADDR_ENV, AgentAddress, connect};
use execlink::config::DEFAULT_MAX_STRING_CHARS;
use execlink::{
    AgentOptions, AgentTracingLayer, ExecutionError, Executor, ProtocolConfig, run_agent,
};

use crate::descriptor::DescriptorLoader;

/// Extension command listing the classes the agent has loaded.
const LOADED_CLASSES: &str = "LOADED_CLASSES";

#[derive(Parser, Debug)]
#[command(name = "execlink-agent")]
#[command(about = "Remote execution agent for an execlink host")]
struct Args {
    /// Host address to connect to (host:port)
    #[arg(long, env = AGENT_ADDR_ENV)]
    connect: AgentAddress,

    /// Directory searched for `<class>.json` descriptors; repeatable
    #[arg(long = "classpath", value_name = "DIR")]
    classpath: Vec<PathBuf>,

    /// Longest string sent unabridged; 0 disables truncation
    #[arg(long, default_value_t = DEFAULT_MAX_STRING_CHARS)]
    max_string_chars: usize,
}

/// `RUST_LOG` wins; otherwise `EXECLINK_LOG` picks the level. Events are also
/// shipped to the host through the returned receiver.
fn init_tracing() -> mpsc::Receiver<Bytes> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("EXECLINK_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "execlink={level},execlink_agent={level},execlink::bridge=warn",
            level = base_level
        ))
    };

    let (agent_layer, logs) = AgentTracingLayer::new();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(agent_layer)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(agent_layer)
            .try_init();
    }
    logs
}

fn loaded_classes(
    executor: &Executor,
    _argument: serde_json::Value,
) -> Result<serde_json::Value, ExecutionError> {
    Ok(serde_json::json!(executor.loaded_classes()))
}

fn protocol(args: &Args) -> ProtocolConfig {
    ProtocolConfig::default()
        .with_max_string_chars((args.max_string_chars > 0).then_some(args.max_string_chars))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let logs = init_tracing();

    let stream = connect(&args.connect)
        .await
        .with_context(|| format!("failed to connect to host at {}", args.connect))?;
    tracing::info!(host = %args.connect, classpath = ?args.classpath, "Connected to host");

    let options = AgentOptions::default()
        .with_protocol(protocol(&args))
        .with_logs(logs)
        .with_extension(LOADED_CLASSES, Arc::new(loaded_classes));
    let loader = Arc::new(DescriptorLoader::new(args.classpath));

    run_agent(stream, loader, options)
        .await
        .context("agent session failed")?;
    Ok(())
}
