//! High-level error types

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core protocol error: {0}")]
    Core(#[from] periph_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] periph_transport::Error),

    #[error("Type error: {0}")]
    Types(#[from] periph_types::Error),

    #[error("Device not connected")]
    NotConnected,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutting down")]
    ShuttingDown,
}

impl Error {
    /// True when retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(periph_transport::Error::Timeout(_))
                | Self::Transport(periph_transport::Error::ConnectionTimeout)
                | Self::Transport(periph_transport::Error::ConnectionClosed)
        )
    }
}
