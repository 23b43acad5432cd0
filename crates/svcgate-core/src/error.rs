//! Error types for svcgate
//!
//! Two families live here:
//!
//! - [`Error`]: failures of the engine's outer shell (configuration, snapshot
//!   I/O, extension lifecycle). These are returned from constructors and
//!   lifecycle methods.
//! - [`TransitionError`]: the closed set of reasons a single message can fail
//!   to move an entry. These never escape the dispatcher; they are logged,
//!   emitted as events, and (for extension failures) recorded on the entry.

use crate::model::Action;
use thiserror::Error;

/// Result type alias for svcgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for svcgate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Workflow definition errors
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Snapshot persistence errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Extension lifecycle errors
    #[error("Extension error ({extension}): {message}")]
    Extension {
        /// Extension identity
        extension: String,
        /// Error message
        message: String,
    },

    /// A queue between the core and an extension was closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a workflow error
    pub fn workflow(msg: impl Into<String>) -> Self {
        Self::Workflow(msg.into())
    }

    /// Create a snapshot error
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Create an extension lifecycle error
    pub fn extension(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extension {
            extension: extension.into(),
            message: message.into(),
        }
    }

    /// Create a channel-closed error
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Reasons a message could not move an entry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The current behavior does not handle this action at all
    #[error("unhandled action {action} from {sender}")]
    UnhandledAction {
        /// Offending action
        action: Action,
        /// Message sender
        sender: String,
    },

    /// The action/sender combination is not valid in the entry's current state
    #[error("action {action} from {sender} not allowed at step {step}")]
    ActionNotAllowed {
        /// Offending action
        action: Action,
        /// Message sender
        sender: String,
        /// Step the entry was at
        step: String,
    },

    /// A reply arrived from an extension that does not own the current step
    #[error("reply from {sender} but entry is waiting on {expected}")]
    SenderMismatch {
        /// Step the entry is waiting on
        expected: String,
        /// Actual reply sender
        sender: String,
    },

    /// An extension reported failure of its step
    #[error("{message}")]
    ExtensionError {
        /// Extension identity
        extension: String,
        /// Error reported by the extension
        message: String,
    },

    /// An extension did not reply within the in-flight deadline
    #[error("extension timeout: no reply from {step} within {timeout_secs}s")]
    ExtensionTimeout {
        /// Step that was in flight
        step: String,
        /// Configured deadline
        timeout_secs: u64,
    },

    /// Workflow lookup for a step that is not in the pipeline
    #[error("step {0} not found in workflow")]
    StepNotFound(String),

    /// Workflow lookup past the first or last step
    #[error("no step beyond boundary {0}")]
    BoundaryReached(String),

    /// The envelope itself cannot be routed
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl TransitionError {
    /// Workflow lookups failing at runtime point at a configuration bug
    pub fn is_workflow_fault(&self) -> bool {
        matches!(
            self,
            TransitionError::StepNotFound(_) | TransitionError::BoundaryReached(_)
        )
    }

    /// Short stable name of the error kind, used in events and logs
    pub fn kind(&self) -> &'static str {
        match self {
            TransitionError::UnhandledAction { .. } => "UnhandledAction",
            TransitionError::ActionNotAllowed { .. } => "ActionNotAllowed",
            TransitionError::SenderMismatch { .. } => "SenderMismatch",
            TransitionError::ExtensionError { .. } => "ExtensionError",
            TransitionError::ExtensionTimeout { .. } => "ExtensionTimeout",
            TransitionError::StepNotFound(_) => "StepNotFound",
            TransitionError::BoundaryReached(_) => "BoundaryReached",
            TransitionError::InvalidMessage(_) => "InvalidMessage",
        }
    }
}
