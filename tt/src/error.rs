//! Error types for the transport and command layers

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the physical line transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("Transport is closed")]
    Closed,

    #[error("Unsupported port target: {0}")]
    Unsupported(String),
}

/// Errors returned by a command exchange
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Table not responding to command. Command: {command}")]
    Timeout { command: String, timeout: Duration },

    #[error("Token stream closed while waiting for response. Command: {command}")]
    StreamClosed { command: String },
}

impl CommandError {
    /// Check if this is a response timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }

    /// Check if the session can keep going after this error
    ///
    /// A timeout leaves the channel usable; a transport failure or a closed
    /// stream does not.
    pub fn is_fatal(&self) -> bool {
        match self {
            CommandError::Transport(_) => true,
            CommandError::StreamClosed { .. } => true,
            CommandError::Timeout { .. } => false,
        }
    }

    /// The command text this error refers to, if any
    pub fn command(&self) -> Option<&str> {
        match self {
            CommandError::Timeout { command, .. } | CommandError::StreamClosed { command } => Some(command),
            CommandError::Transport(_) => None,
        }
    }
}
