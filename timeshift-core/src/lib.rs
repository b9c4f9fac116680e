//! Timeshift Core - buffering strategies for a remote DVR backend
//!
//! A media-center host plays live television, time-shifted television and
//! recordings through one seekable stream abstraction,
//! [`TimeshiftBuffer`](timeshift::TimeshiftBuffer). Behind it sit
//! interchangeable strategies that reconcile an always-advancing remote stream
//! with random seek, pause and real-time reads.
//!
//! The crate is layered bottom-up:
//!
//! - [`network`] and [`backend`] form the HTTP control plane
//! - [`transport`] opens byte streams and the raw block socket
//! - [`timeshift`] holds the buffering strategies and their shared machinery
//! - [`simulation`] is an in-process DVR used by tests and the CLI

pub mod backend;
pub mod config;
pub mod network;
pub mod simulation;
pub mod timeshift;
pub mod tracing_setup;
pub mod transport;

// Re-export main types for convenient access
pub use backend::{Backend, BackendError, HttpBackend};
pub use config::{ConfigError, StreamingMethod, TimeshiftConfig};
pub use simulation::SimulatedDvr;
pub use timeshift::{
    ActiveStream, StreamContext, StreamKind, TimeshiftBuffer, TimeshiftError,
    create_timeshift_buffer,
};
pub use transport::TransportError;

/// Errors that can bubble up from any timeshift subsystem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timeshift error: {0}")]
    Timeshift(#[from] TimeshiftError),

    #[error("Setup error: {0}")]
    Context(#[from] timeshift::ContextError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(ConfigError::Invalid { reason }) => {
                format!("Invalid configuration: {reason}")
            }
            Error::Config(_) => "Configuration file could not be loaded".to_string(),
            Error::Backend(BackendError::NotFound { stream }) => {
                format!("Stream {stream} is not available")
            }
            Error::Backend(_) => "The DVR backend could not be reached".to_string(),
            Error::Transport(_) => "Connection to the stream failed".to_string(),
            Error::Timeshift(e) => match e {
                TimeshiftError::PrebufferTimeout { .. } => {
                    "The stream did not start in time".to_string()
                }
                TimeshiftError::StreamNotReady { reason } => {
                    format!("The stream is not ready: {reason}")
                }
                TimeshiftError::TranscodeFailed { .. } => {
                    "The backend could not transcode the stream".to_string()
                }
                TimeshiftError::Backend(BackendError::NotFound { stream }) => {
                    format!("Stream {stream} is not available")
                }
                _ => "Playback error occurred".to_string(),
            },
            Error::Context(_) => "Could not set up the backend connection".to_string(),
            Error::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Error::Config(ConfigError::Invalid { .. }))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
