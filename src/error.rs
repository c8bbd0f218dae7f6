use thiserror::Error;

/// Result type for fireplace operations
pub type Result<T> = std::result::Result<T, FireplaceError>;

/// Errors that can occur when interacting with IntelliFire fireplaces
#[derive(Error, Debug)]
pub enum FireplaceError {
    /// Credentials are missing or were rejected by the cloud service
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The cloud service answered with a non-success status
    #[error("Cloud request failed: {0}")]
    CloudStatus(reqwest::StatusCode),

    /// No LAN address is known for the device, or the local call failed
    #[error("Local transport unavailable: {0}")]
    LocalUnavailable(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unexpected response from the cloud or a device
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
