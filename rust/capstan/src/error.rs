use std::fmt;

use capstan_core::MethodId;

/// Errors that can occur while building a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Two methods were registered under the same identity.
    DuplicateMethod(MethodId),

    /// No Tokio runtime was available to host the dispatch task.
    NoRuntime,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::DuplicateMethod(id) => {
                write!(f, "method {} is registered more than once", id)
            }
            ServerError::NoRuntime => {
                write!(f, "no tokio runtime available to run the dispatch loop")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// Prefix for errors produced by the engine itself.
pub(crate) const ERROR_PREFIX: &str = "capstan server";

pub(crate) fn server_error(message: impl Into<String>) -> capstan_core::Error {
    capstan_core::Error::new(capstan_core::ErrorKind::Failed, ERROR_PREFIX, message)
}
