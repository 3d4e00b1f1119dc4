use thiserror::Error;

/// Errors surfaced by a watch session.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The child process could not be started.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// A trigger pattern failed to compile.
    #[error("invalid trigger pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The session has begun terminating; no further input or trigger
    /// registrations are accepted.
    #[error("session is closed")]
    SessionClosed,

    /// Writing to the child's input failed. The session treats this the
    /// same as a process exit and begins terminating.
    #[error("failed to write to process input: {0}")]
    Write(String),
}
