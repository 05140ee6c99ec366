//! Error values carried by rejected answers.
//!
//! A single [`Error`] value is cloned to every party that observes a failed
//! call: the direct caller's returner, everyone awaiting the answer, and every
//! pipelined call queued against it. Clones compare equal, so a pipelined
//! caller can tell it received the original cause rather than a new error.

use std::borrow::Cow;
use std::fmt;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic failure: a method body error, a misuse of the call API, or a
    /// malformed pipeline path.
    Failed,
    /// The callee is temporarily unable to accept work.
    Overloaded,
    /// The capability is no longer reachable.
    Disconnected,
    /// The method identity is not implemented by the target.
    Unimplemented,
}

impl ErrorKind {
    /// Short lowercase name used in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Failed => "failed",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error with a kind, an optional component prefix, and a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    prefix: Cow<'static, str>,
    message: String,
}

impl Error {
    /// Create an error with an explicit component prefix.
    pub fn new(
        kind: ErrorKind,
        prefix: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            prefix: prefix.into(),
            message: message.into(),
        }
    }

    /// A [`ErrorKind::Failed`] error without a prefix.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, "", message)
    }

    /// A [`ErrorKind::Unimplemented`] error without a prefix.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, "", message)
    }

    /// A [`ErrorKind::Disconnected`] error without a prefix.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, "", message)
    }

    /// A [`ErrorKind::Overloaded`] error without a prefix.
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, "", message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the same error with `prefix` in front of any existing prefix.
    pub fn annotate(mut self, prefix: impl Into<Cow<'static, str>>) -> Self {
        let prefix = prefix.into();
        self.prefix = if self.prefix.is_empty() {
            prefix
        } else {
            Cow::Owned(format!("{}: {}", prefix, self.prefix))
        };
        self
    }

    /// Whether this error reports a missing method.
    pub fn is_unimplemented(&self) -> bool {
        self.kind == ErrorKind::Unimplemented
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.prefix, self.message)
        }
    }
}

impl std::error::Error for Error {}
