//! Error types and error handling strategy.
//!
//! The scheduler expresses internal invariants as debug assertions, not as
//! recoverable conditions: queue operations are infallible, allocation
//! failure is fatal, and behavioural errors inside a cown are the cown's
//! responsibility. Typed errors exist only at the outer surface, where the
//! embedder can actually act on them:
//!
//! - configuration validation before the pool is built
//! - thread spawning while the pool starts
//! - lifecycle misuse (running the same pool twice)
//!
//! Errors are explicit and typed; there are no stringly-typed errors.

use core::fmt;

use crate::config::ConfigError;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The scheduler configuration failed validation.
    InvalidConfig,
    /// The pool's run loop was entered a second time.
    AlreadyRunning,
    /// An OS worker thread could not be spawned.
    ThreadSpawn,
    /// A worker thread panicked and unwound out of its run loop.
    WorkerPanicked,
}

impl ErrorKind {
    /// Returns a short static description of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid configuration",
            Self::AlreadyRunning => "pool is already running",
            Self::ThreadSpawn => "failed to spawn worker thread",
            Self::WorkerPanicked => "worker thread panicked",
        }
    }
}

/// An error from the scheduler's outer surface.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    /// Creates a new error of the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Attaches a human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind.as_str()),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::InvalidConfig).with_message(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::ThreadSpawn).with_message(err.to_string())
    }
}

/// Convenience alias for results on the scheduler's outer surface.
pub type Result<T> = std::result::Result<T, Error>;
