//! Custom tracing layer for the agent process.
//!
//! Ships tracing events to the host as JSON lines on the `$log` channel,
//! preserving target and level. The host re-emits them under `execlink::agent`.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::AgentLogRecord;

/// Events from the wire layer are never shipped: writing a log frame must not
/// produce another log event.
const UNSHIPPED_TARGET_PREFIX: &str = "execlink::bridge";

/// Queue depth between the layer and the `$log` channel. Events beyond it are dropped.
pub const LOG_QUEUE_DEPTH: usize = 1024;

pub struct AgentTracingLayer {
    tx: mpsc::Sender<Bytes>,
}

impl AgentTracingLayer {
    /// Layer plus the receiving end to hand to `run_agent`.
    pub fn new() -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(LOG_QUEUE_DEPTH);
        (Self { tx }, rx)
    }
}

impl<S> Layer<S> for AgentTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(UNSHIPPED_TARGET_PREFIX) {
            return;
        }

        let mut text = EventText::default();
        event.record(&mut text);

        let record = AgentLogRecord {
            target: target.to_string(),
            level: metadata.level().to_string().to_ascii_lowercase(),
            message: text.into_message(),
        };
        // Dropped when the queue is full.
        if let Ok(mut line) = serde_json::to_vec(&record) {
            line.push(b'\n');
            let _ = self.tx.try_send(Bytes::from(line));
        }
    }
}

/// Event message followed by its other fields as `name=value`.
#[derive(Default)]
struct EventText {
    message: String,
    fields: Vec<String>,
}

impl EventText {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let fields = self.fields.join(" ");
        if self.message.is_empty() {
            fields
        } else {
            format!("{} {fields}", self.message)
        }
    }
}

impl Visit for EventText {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }
}

/// Re-emit an agent log record on the host under target `execlink::agent`.
pub fn emit_agent_log(record: &AgentLogRecord) {
    let target = record.target.as_str();
    let message = record.message.as_str();
    match record.level.as_str() {
        "error" => tracing::error!(target: "execlink::agent", agent_target = target, "{message}"),
        "warn" => tracing::warn!(target: "execlink::agent", agent_target = target, "{message}"),
        "debug" => tracing::debug!(target: "execlink::agent", agent_target = target, "{message}"),
        "trace" => tracing::trace!(target: "execlink::agent", agent_target = target, "{message}"),
        _ => tracing::info!(target: "execlink::agent", agent_target = target, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn ships_events_as_json_lines_except_bridge() {
        let (layer, mut rx) = AgentTracingLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "execlink::agent::executor", "Class loaded");
            tracing::debug!(target: "execlink::bridge::mux", "Frame written");
            tracing::warn!(target: "user", count = 3, "careful");
        });

        let first = rx.try_recv().unwrap();
        assert_eq!(
            &first[..],
            &b"{\"target\":\"execlink::agent::executor\",\"level\":\"info\",\"message\":\"Class loaded\"}\n"[..]
        );
        let second: AgentLogRecord =
            serde_json::from_slice(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(second.target, "user");
        assert_eq!(second.level, "warn");
        assert_eq!(second.message, "careful count=3");
        assert!(rx.try_recv().is_err());
    }
}
