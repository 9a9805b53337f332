//! Class loading seam.
//!
//! How bytecode becomes runnable is up to the embedding: the agent only needs
//! to define classes, optionally redefine them, look them up on a classpath
//! and call their methods.

use std::sync::Arc;

use crate::bridge::protocol::{ClassBytecodes, StackFrame};
use crate::error::{ExecutionError, ResolutionException, UserException};
use crate::value::Value;

use super::context::InvocationContext;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("redefinition is not supported by this loader")]
    Unsupported,
    #[error("malformed class {name}: {reason}")]
    Malformed { name: String, reason: String },
    #[error("class {0} is already defined")]
    Duplicate(String),
    #[error("bad classpath entry {path}: {reason}")]
    Classpath { path: String, reason: String },
}

/// Produces class handles from bytecode.
pub trait ClassLoader: Send + Sync {
    fn define(&self, class: &ClassBytecodes) -> Result<Arc<dyn ClassHandle>, LoadError>;

    /// Replace an already loaded class with new bytecode.
    fn redefine(
        &self,
        _current: &Arc<dyn ClassHandle>,
        _class: &ClassBytecodes,
    ) -> Result<Arc<dyn ClassHandle>, LoadError> {
        Err(LoadError::Unsupported)
    }

    /// Find a class not loaded through `define`, e.g. on the classpath.
    fn find_class(&self, _name: &str) -> Option<Arc<dyn ClassHandle>> {
        None
    }

    fn add_to_classpath(&self, path: &str) -> Result<(), LoadError>;
}

/// A loaded class.
pub trait ClassHandle: Send + Sync {
    fn name(&self) -> &str;

    fn has_method(&self, method: &str) -> bool;

    /// Run a static entry point. Called on a blocking thread.
    fn invoke(&self, method: &str, ctx: &InvocationContext) -> Result<Value, Thrown>;

    fn static_field(&self, field: &str) -> Option<Value>;
}

/// Abnormal completion of user code.
#[derive(Debug, Clone, PartialEq)]
pub enum Thrown {
    Exception {
        message: Option<String>,
        class_name: String,
        stack_trace: Vec<StackFrame>,
        cause: Option<Box<Thrown>>,
    },
    /// User code touched a reference that could not be resolved.
    Unresolved {
        id: i32,
        stack_trace: Vec<StackFrame>,
    },
    /// User code observed a stop request.
    Stopped,
}

impl Thrown {
    pub fn exception(class_name: impl Into<String>, message: Option<String>) -> Self {
        Self::Exception {
            message,
            class_name: class_name.into(),
            stack_trace: Vec::new(),
            cause: None,
        }
    }

    pub fn with_stack(mut self, frames: Vec<StackFrame>) -> Self {
        match &mut self {
            Self::Exception { stack_trace, .. } | Self::Unresolved { stack_trace, .. } => {
                *stack_trace = frames;
            }
            Self::Stopped => {}
        }
        self
    }

    pub fn with_cause(mut self, next: Thrown) -> Self {
        if let Self::Exception { cause, .. } = &mut self {
            *cause = Some(Box::new(next));
        }
        self
    }

    pub fn into_error(self) -> ExecutionError {
        match self {
            Self::Exception {
                message,
                class_name,
                stack_trace,
                cause,
            } => {
                let user = UserException::new(message, class_name, stack_trace);
                ExecutionError::User(match cause {
                    Some(cause) => user.with_cause(cause.into_error()),
                    None => user,
                })
            }
            Self::Unresolved { id, stack_trace } => {
                ExecutionError::Resolution(ResolutionException::new(id, stack_trace))
            }
            Self::Stopped => ExecutionError::Stopped,
        }
    }
}
