//! Typed outcomes of execution-control operations.
//!
//! Application-level failures (user exceptions, unresolved references, class
//! install failures, missing capabilities) leave the session usable.
//! `EngineTerminated` is terminal: the agent, its process, or the transport is gone.

use crate::bridge::protocol::StackFrame;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    /// The capability is absent in this agent build.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Host- or agent-side failure not attributable to user code.
    #[error("internal problem: {0}")]
    InternalProblem(String),

    #[error(transparent)]
    User(#[from] UserException),

    #[error(transparent)]
    Resolution(#[from] ResolutionException),

    /// Some or all classes failed to install; `installed[i]` is the fate of class `i`.
    #[error("{message}")]
    ClassInstall {
        message: String,
        installed: Vec<bool>,
    },

    #[error("execution stopped")]
    Stopped,

    #[error("engine terminated: {0}")]
    EngineTerminated(String),
}

impl ExecutionError {
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalProblem(message.into())
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::EngineTerminated(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EngineTerminated(_))
    }
}

/// User code threw.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{exception_class}: {}", .message.as_deref().unwrap_or("<no message>"))]
pub struct UserException {
    pub message: Option<String>,
    pub exception_class: String,
    pub stack_trace: Vec<StackFrame>,
    /// Next link of the cause chain: another `User`, a `Resolution`, or an `InternalProblem`.
    pub cause: Option<Box<ExecutionError>>,
}

impl UserException {
    pub fn new(
        message: Option<String>,
        exception_class: impl Into<String>,
        stack_trace: Vec<StackFrame>,
    ) -> Self {
        Self {
            message,
            exception_class: exception_class.into(),
            stack_trace,
            cause: None,
        }
    }

    /// Causes with no wire link of their own are kept as `InternalProblem`.
    pub fn with_cause(mut self, cause: impl Into<ExecutionError>) -> Self {
        let cause = match cause.into() {
            cause @ (ExecutionError::User(_)
            | ExecutionError::Resolution(_)
            | ExecutionError::InternalProblem(_)) => cause,
            other => ExecutionError::InternalProblem(other.to_string()),
        };
        self.cause = Some(Box::new(cause));
        self
    }

    /// Iterates this exception and every cause, outermost first.
    pub fn chain(&self) -> CauseChain<'_> {
        CauseChain {
            next: Some(Link::User(self)),
        }
    }
}

/// An unresolved (corralled) reference was invoked.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("attempted to use unresolved reference #{id}")]
pub struct ResolutionException {
    pub id: i32,
    pub stack_trace: Vec<StackFrame>,
}

impl ResolutionException {
    pub fn new(id: i32, stack_trace: Vec<StackFrame>) -> Self {
        Self { id, stack_trace }
    }
}

/// One element of a user exception's cause chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Link<'a> {
    User(&'a UserException),
    Resolution(&'a ResolutionException),
    Internal(&'a str),
}

pub struct CauseChain<'a> {
    next: Option<Link<'a>>,
}

impl<'a> Iterator for CauseChain<'a> {
    type Item = Link<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        if let Link::User(user) = current {
            self.next = user.cause.as_deref().and_then(|cause| match cause {
                ExecutionError::User(next) => Some(Link::User(next)),
                ExecutionError::Resolution(next) => Some(Link::Resolution(next)),
                ExecutionError::InternalProblem(message)
                | ExecutionError::NotImplemented(message)
                | ExecutionError::EngineTerminated(message)
                | ExecutionError::ClassInstall { message, .. } => Some(Link::Internal(message)),
                ExecutionError::Stopped => Some(Link::Internal("execution stopped")),
            });
        }
        Some(current)
    }
}
