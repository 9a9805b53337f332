//! Wire protocol types for host-agent communication.
//!
//! One physical stream carries several logical channels:
//! - **$command** (both directions): one request, then exactly one response
//! - **out / err** (agent to host): user program output
//! - **$<name>-input-requested** (agent to host) and **<name>** (host to agent): user input
//! - **$stop** (host to agent): stop side channel for the debug-attached variant
//! - **$log** (agent to host): agent tracing events as JSON lines

use serde::{Deserialize, Serialize};

/// Channel carrying requests and responses.
pub const COMMAND_CHANNEL: &str = "$command";
/// Channel carrying user-code standard output.
pub const OUT_CHANNEL: &str = "out";
/// Channel carrying user-code standard error.
pub const ERR_CHANNEL: &str = "err";
/// Default user input channel.
pub const IN_CHANNEL: &str = "in";
/// Stop side channel; any frame asks the agent to stop the running invocation.
pub const STOP_CHANNEL: &str = "$stop";
/// Agent log records.
pub const LOG_CHANNEL: &str = "$log";

/// Name of the channel the agent uses to ask for more data on input channel `name`.
pub fn input_requested_channel(name: &str) -> String {
    format!("${name}-input-requested")
}

/// Marker written before every request tag.
pub const COMMAND_PREFIX: u32 = 0xC03D_C01A;

/// Built-in request tags.
pub mod tags {
    pub const LOAD: &str = "LOAD";
    pub const REDEFINE: &str = "REDEFINE";
    pub const INVOKE: &str = "INVOKE";
    pub const VAR_VALUE: &str = "VAR_VALUE";
    pub const ADD_CLASSPATH: &str = "ADD_CLASSPATH";
    pub const STOP: &str = "STOP";
    pub const CLOSE: &str = "CLOSE";

    pub const BUILTIN: [&str; 7] = [
        LOAD,
        REDEFINE,
        INVOKE,
        VAR_VALUE,
        ADD_CLASSPATH,
        STOP,
        CLOSE,
    ];

    pub fn is_builtin(tag: &str) -> bool {
        BUILTIN.contains(&tag)
    }
}

/// Response status codes. Stable contract; never renumber.
pub mod status {
    pub const SUCCESS: i32 = 100;
    pub const TERMINATED: i32 = 101;
    pub const NOT_IMPLEMENTED: i32 = 102;
    pub const INTERNAL_PROBLEM: i32 = 103;
    pub const USER_EXCEPTION: i32 = 104;
    pub const CORRALLED: i32 = 105;
    pub const CLASS_INSTALL_EXCEPTION: i32 = 106;
    pub const STOPPED: i32 = 107;
    pub const USER_EXCEPTION_CHAINED: i32 = 108;
}

/// Stands in for a null string where "no value" must differ from "".
pub const NULL_STRING_SENTINEL: &str = "\u{2}*\u{3c0}*NULL*\u{3c0}*\u{2}";

/// Identifier for a host session, used to correlate logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binary class name plus the raw bytes that define it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassBytecodes {
    pub name: String,
    pub bytecodes: Vec<u8>,
}

impl ClassBytecodes {
    pub fn new(name: impl Into<String>, bytecodes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytecodes: bytecodes.into(),
        }
    }
}

/// One stack trace element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub declaring_class: String,
    pub method_name: String,
    pub file_name: Option<String>,
    /// Negative when unknown.
    pub line_number: i32,
}

impl StackFrame {
    pub fn new(
        declaring_class: impl Into<String>,
        method_name: impl Into<String>,
        file_name: Option<String>,
        line_number: i32,
    ) -> Self {
        Self {
            declaring_class: declaring_class.into(),
            method_name: method_name.into(),
            file_name,
            line_number,
        }
    }
}

impl std::fmt::Display for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}(", self.declaring_class, self.method_name)?;
        match (&self.file_name, self.line_number) {
            (Some(file), line) if line >= 0 => write!(f, "{file}:{line})"),
            (Some(file), _) => write!(f, "{file})"),
            (None, _) => write!(f, "Unknown Source)"),
        }
    }
}

/// Requests from host to agent on the command channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Load(Vec<ClassBytecodes>),
    Redefine(Vec<ClassBytecodes>),
    Invoke {
        class_name: String,
        method_name: String,
    },
    VarValue {
        class_name: String,
        field_name: String,
    },
    AddClasspath(String),
    Stop,
    Close,
    Extension {
        command: String,
        argument: serde_json::Value,
    },
}

impl Request {
    pub fn tag(&self) -> &str {
        match self {
            Self::Load(_) => tags::LOAD,
            Self::Redefine(_) => tags::REDEFINE,
            Self::Invoke { .. } => tags::INVOKE,
            Self::VarValue { .. } => tags::VAR_VALUE,
            Self::AddClasspath(_) => tags::ADD_CLASSPATH,
            Self::Stop => tags::STOP,
            Self::Close => tags::CLOSE,
            Self::Extension { command, .. } => command,
        }
    }
}

/// Optional body of a successful response.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// Rendered value (invoke, var-value).
    Text(String),
    /// Extension command result.
    Json(serde_json::Value),
}

impl Payload {
    pub fn into_text(self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(text) => text,
            Self::Json(value) => value.to_string(),
        }
    }

    pub fn into_json(self) -> serde_json::Value {
        match self {
            Self::Empty => serde_json::Value::Null,
            Self::Text(text) => serde_json::Value::String(text),
            Self::Json(value) => value,
        }
    }
}

/// Exactly one response per request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Payload),
    Failure(crate::error::ExecutionError),
}

impl Response {
    pub fn into_result(self) -> Result<Payload, crate::error::ExecutionError> {
        match self {
            Self::Success(payload) => Ok(payload),
            Self::Failure(error) => Err(error),
        }
    }
}

impl From<Result<Payload, crate::error::ExecutionError>> for Response {
    fn from(result: Result<Payload, crate::error::ExecutionError>) -> Self {
        match result {
            Ok(payload) => Self::Success(payload),
            Err(error) => Self::Failure(error),
        }
    }
}

/// Agent tracing event shipped on the `$log` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLogRecord {
    pub target: String,
    pub level: String,
    pub message: String,
}
