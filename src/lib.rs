//! vidrelay: staged video relay
//!
//! Resolves a video reference to metadata, asks the backend to acquire the
//! file, then routes it to a bulk-storage folder and optionally to a sharing
//! platform.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Stage Sequencer              │
//! │  metadata → acquire → folders → store   │
//! │            └──────→ platform (optional) │
//! └──────┬──────────────┬──────────────┬────┘
//!        ▼              ▼              ▼
//!  Session State   Error Channel   Progress Synthesizer
//!                                      │
//!                       Recovery Flow (reauth prompt)
//! ```
//!
//! Every stage validates its preconditions locally, issues exactly one
//! backend request, and only mutates the session when that request succeeds.

pub mod backend;
pub mod config;
pub mod workflow;

// Re-exports for convenience
pub use backend::{Backend, HttpBackend};
pub use config::Config;
pub use workflow::{
    ErrorChannel, ProgressSynthesizer, RecoveryFlow, SessionState, Stage, StageSequencer,
};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{message}")]
    Backend { message: String },

    #[error("{0}")]
    Transport(String),

    #[error("{message}")]
    AuthorizationExpired { message: String },

    #[error("{0} request already in flight")]
    StageBusy(workflow::StageKind),

    #[error("Session ended, sign in again to continue")]
    SessionEnded,

    #[error("{0} result discarded: a new video was selected while it was in flight")]
    Superseded(workflow::StageKind),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse classification of failures as seen by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caught locally before any request was sent
    Validation,
    /// The backend answered with an error payload
    Backend,
    /// No interpretable response arrived
    Transport,
    /// Backend error carrying the reauthorization marker
    AuthorizationExpired,
    /// A trigger arrived while the same stage was in flight
    Busy,
    /// Configuration, filesystem and other local failures
    Local,
}

impl Error {
    /// Shorthand for a validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Shorthand for a backend-reported failure
    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend {
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Backend { .. } => ErrorKind::Backend,
            Error::Transport(_) => ErrorKind::Transport,
            Error::AuthorizationExpired { .. } => ErrorKind::AuthorizationExpired,
            Error::StageBusy(_) => ErrorKind::Busy,
            Error::SessionEnded
            | Error::Superseded(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Toml(_) => ErrorKind::Local,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(Error::backend("x").kind(), ErrorKind::Backend);
        assert_eq!(Error::Transport("x".into()).kind(), ErrorKind::Transport);
        assert_eq!(
            Error::AuthorizationExpired {
                message: "x".into()
            }
            .kind(),
            ErrorKind::AuthorizationExpired
        );
        assert_eq!(Error::StageBusy(workflow::StageKind::Storage).kind(), ErrorKind::Busy);
        assert_eq!(Error::SessionEnded.kind(), ErrorKind::Local);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(Error::from(io).kind(), ErrorKind::Local);
    }

    #[test]
    fn test_backend_message_is_verbatim() {
        let err = Error::backend("Video unavailable");
        assert_eq!(err.to_string(), "Video unavailable");
    }
}
