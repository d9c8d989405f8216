use std::sync::Arc;

use crate::{Arity, Selector};

/// Application-visible failures of a call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("undefined method `{selector}' for an instance of {class}")]
    NoMethod { selector: Selector, class: Arc<str> },
    #[error("private method `{selector}' called for an instance of {class}")]
    PrivateMethod { selector: Selector, class: Arc<str> },
    #[error("protected method `{selector}' called for an instance of {class}")]
    ProtectedMethod { selector: Selector, class: Arc<str> },
    #[error(
        "wrong number of arguments for `{selector}' (given {given}, expected {expected})"
    )]
    ArgumentCount {
        selector: Selector,
        given: usize,
        expected: Arity,
    },
    #[error("no implicit conversion: expected {expected}, got {got}")]
    TypeError {
        expected: &'static str,
        got: &'static str,
    },
    #[error("method `{selector}' not defined in {module}")]
    NameError { selector: Selector, module: Arc<str> },
    #[error("{0}")]
    Raised(String),
    #[error("call site {0} does not belong to this runtime")]
    InvalidCallSite(u32),
    #[error(transparent)]
    Safepoint(#[from] SafepointError),
}

impl RuntimeError {
    /// `true` when no callable could be resolved for the call.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(
            self,
            Self::NoMethod { .. }
                | Self::PrivateMethod { .. }
                | Self::ProtectedMethod { .. }
        )
    }
}

/// Failures of the global pause protocol. All but `Reentrant` and
/// `AttachedThread` are fatal for the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SafepointError {
    #[error("safepoint barrier is broken")]
    BrokenBarrier,
    #[error("safepoint requested from inside a safepoint action")]
    Reentrant,
    #[error("signal-context safepoint requested from an attached runtime thread")]
    AttachedThread,
    #[error("runtime is shut down after a fatal fault")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("thread is already attached to this runtime")]
    AlreadyAttached,
    #[error("runtime is shut down after a fatal fault")]
    ShutDown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid runtime configuration: {0}")]
pub struct ConfigError(pub &'static str);
