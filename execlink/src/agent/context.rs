//! What user code sees while it runs: output streams, input, and the stop checkpoint.
//!
//! User code runs on a blocking thread; every operation here blocks.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::gate::ExecutionGate;
use super::loader::Thrown;
use crate::bridge::mux::ChannelWriter;

/// Blocking byte sink for user output.
pub trait OutputSink: Send + Sync {
    fn write(&self, data: &[u8]) -> io::Result<()>;
}

/// Blocking byte source for user input. `None` is end of input.
pub trait UserInput: Send + Sync {
    fn read(&self) -> io::Result<Option<Bytes>>;
}

impl OutputSink for ChannelWriter {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.write_blocking(data)
    }
}

impl OutputSink for mpsc::UnboundedSender<Bytes> {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        self.send(Bytes::copy_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "output receiver closed"))
    }
}

/// Input over the multiplexer: each read sends a request byte on the
/// input-requested channel and waits for the host's answer.
pub struct ChannelInput {
    request: ChannelWriter,
    data: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl ChannelInput {
    pub fn new(request: ChannelWriter, data: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            request,
            data: Mutex::new(data),
        }
    }
}

impl UserInput for ChannelInput {
    fn read(&self) -> io::Result<Option<Bytes>> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        self.request.write_blocking(&[1])?;
        // A zero-length chunk or a closed channel both mean end of input.
        Ok(data.blocking_recv().filter(|chunk| !chunk.is_empty()))
    }
}

/// Input source that is always at end of input.
pub struct NoInput;

impl UserInput for NoInput {
    fn read(&self) -> io::Result<Option<Bytes>> {
        Ok(None)
    }
}

/// The agent's user-facing streams.
#[derive(Clone)]
pub struct AgentStreams {
    pub out: Arc<dyn OutputSink>,
    pub err: Arc<dyn OutputSink>,
    pub input: Arc<dyn UserInput>,
}

pub struct InvocationContext {
    gate: Arc<ExecutionGate>,
    streams: AgentStreams,
}

impl InvocationContext {
    pub fn new(gate: Arc<ExecutionGate>, streams: AgentStreams) -> Self {
        Self { gate, streams }
    }

    /// Raise `Thrown::Stopped` if a stop was requested. Long-running user
    /// code should call this regularly.
    pub fn checkpoint(&self) -> Result<(), Thrown> {
        if self.gate.stop_requested() {
            Err(Thrown::Stopped)
        } else {
            Ok(())
        }
    }

    pub fn print(&self, text: &str) -> Result<(), Thrown> {
        self.streams.out.write(text.as_bytes()).map_err(io_thrown)
    }

    pub fn eprint(&self, text: &str) -> Result<(), Thrown> {
        self.streams.err.write(text.as_bytes()).map_err(io_thrown)
    }

    /// Next chunk of user input, or `None` at end of input.
    pub fn read_input(&self) -> Result<Option<Bytes>, Thrown> {
        self.streams.input.read().map_err(io_thrown)
    }
}

fn io_thrown(e: io::Error) -> Thrown {
    Thrown::exception("std::io::Error", Some(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(gate: Arc<ExecutionGate>) -> (InvocationContext, mpsc::UnboundedReceiver<Bytes>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        let streams = AgentStreams {
            out: Arc::new(out_tx),
            err: Arc::new(err_tx),
            input: Arc::new(NoInput),
        };
        (InvocationContext::new(gate, streams), out_rx)
    }

    #[test]
    fn checkpoint_raises_only_when_stopped() {
        let gate = Arc::new(ExecutionGate::new());
        let (ctx, _out) = context(Arc::clone(&gate));
        let call = gate.enter_user_code();
        assert_eq!(ctx.checkpoint(), Ok(()));
        gate.request_stop();
        assert_eq!(ctx.checkpoint(), Err(Thrown::Stopped));
        assert!(call.finish());
    }

    #[test]
    fn print_reaches_sink_and_reports_closed_sink() {
        let (ctx, mut out) = context(Arc::new(ExecutionGate::new()));
        ctx.print("hello").unwrap();
        assert_eq!(out.try_recv().unwrap(), Bytes::from_static(b"hello"));

        drop(out);
        let err = ctx.print("lost").unwrap_err();
        assert!(matches!(err, Thrown::Exception { ref class_name, .. } if class_name == "std::io::Error"));
    }

    #[test]
    fn no_input_is_end_of_input() {
        let (ctx, _out) = context(Arc::new(ExecutionGate::new()));
        assert_eq!(ctx.read_input(), Ok(None));
    }
}
