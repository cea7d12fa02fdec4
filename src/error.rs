use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Invalid verification code")]
    InvalidCode,

    #[error("Invalid phone number")]
    InvalidPhoneNumber,

    #[error("Two-factor authentication is enabled on this account and is not supported")]
    TwoFactorRequired,

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Download failed for message {message_id}: {reason}")]
    Download { message_id: i32, reason: String },

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Relay is already running")]
    AlreadyRunning,

    #[error("Relay is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
