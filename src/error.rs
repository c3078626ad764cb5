//! Error types for the ticketgate service.

use thiserror::Error;

/// Main error type for ticketgate operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Issue tracker (upstream REST API) errors
    #[error("Tracker error: {0}")]
    Tracker(String),

    /// Ticket token store errors
    #[error("Ticket store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ticketgate operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
