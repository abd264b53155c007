//! Error types for the ingest bridge.
//!
//! All errors implement `std::error::Error` and carry enough context to log a useful line
//! without a backtrace.
//!
//! ## Error Categories
//!
//! - **Configuration Errors**: invalid or unreadable bridge configuration
//! - **Signaling Errors**: malformed or unknown wire messages (see [`SignalError`])
//! - **Transport Errors**: failures reported by the media transport layer
//! - **Encoder Errors**: subprocess spawn, pipe, and exit failures
//! - **Registry Errors**: session lookups and transport ownership conflicts
//!
//! ## Containment
//!
//! Most errors are contained where they happen: a bad message is logged and dropped, a
//! failed candidate is logged and ignored. Only errors classified by
//! [`BridgeError::is_session_fatal`] escalate to tearing a session down.
//!
//! ```rust
//! use hlsbridge::BridgeError;
//!
//! let error = BridgeError::encoder_exit("exit status: 1");
//! assert!(error.is_session_fatal());
//!
//! let error = BridgeError::transport("candidate rejected");
//! assert!(!error.is_session_fatal());
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::signaling::SignalError;
use crate::types::SessionId;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Configuration file error: {path}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration parse error")]
    ConfigParse {
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Signaling error: {0}")]
    Signal(#[from] SignalError),

    #[error("Transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to spawn encoder '{program}'")]
    EncoderSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder pipe error: {context}")]
    EncoderPipe {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Encoder exited unexpectedly: {status}")]
    EncoderExit { status: String },

    #[error("Session {session} not found")]
    SessionNotFound { session: SessionId },

    #[error("Transport handle is already owned by session {existing}")]
    DuplicateTransport { existing: SessionId },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("WebSocket error")]
    WebSocket {
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("Bridge core is shut down")]
    Shutdown,
}

impl BridgeError {
    /// Returns whether this error must tear down the session it occurred in.
    ///
    /// Encoder failures end the session; everything else is contained at the message or
    /// frame that produced it.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            BridgeError::EncoderSpawn { .. } => true,
            BridgeError::EncoderPipe { .. } => true,
            BridgeError::EncoderExit { .. } => true,
            BridgeError::Config { .. } => false,
            BridgeError::ConfigFile { .. } => false,
            BridgeError::ConfigParse { .. } => false,
            BridgeError::Signal(_) => false,
            BridgeError::Transport { .. } => false,
            BridgeError::SessionNotFound { .. } => false,
            BridgeError::DuplicateTransport { .. } => false,
            BridgeError::Io { .. } => false,
            BridgeError::WebSocket { .. } => false,
            BridgeError::Shutdown => false,
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        BridgeError::Config { reason: reason.into() }
    }

    /// Helper constructor for transport errors.
    pub fn transport(reason: impl Into<String>) -> Self {
        BridgeError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for encoder spawn failures.
    pub fn encoder_spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        BridgeError::EncoderSpawn { program: program.into(), source }
    }

    /// Helper constructor for encoder pipe failures.
    pub fn encoder_pipe(context: impl Into<String>, source: Option<std::io::Error>) -> Self {
        BridgeError::EncoderPipe { context: context.into(), source }
    }

    /// Helper constructor for unexpected encoder exits.
    pub fn encoder_exit(status: impl Into<String>) -> Self {
        BridgeError::EncoderExit { status: status.into() }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BridgeError::Io { context: context.into(), source }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io { context: "unspecified I/O operation".to_string(), source: err }
    }
}

impl From<serde_yaml_ng::Error> for BridgeError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        BridgeError::ConfigParse { source: err }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::WebSocket { source: err }
    }
}
