//! Wire layer between host and agent.
//!
//! # Architecture
//!
//! - **frame**: `[name len][name][payload len][payload]` codec for the physical stream
//! - **mux**: logical channels multiplexed onto one physical stream
//! - **protocol**: request/response types, channel names, status codes
//! - **codec**: binary request/response codecs for the command channel
//! - **transport**: TCP listener/connector used by supervised agents

pub mod codec;
pub mod frame;
pub mod mux;
pub mod protocol;
pub mod transport;
