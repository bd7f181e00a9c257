use thiserror::Error;

#[derive(Error, Debug)]
pub enum FidoError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Malformed device response: {0}")]
    MalformedResponse(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid client data hash length: expected 32 bytes, got {0}")]
    InvalidClientDataHash(usize),
}

pub type Result<T> = std::result::Result<T, FidoError>;

/// Failure of a whole assertion request, as observed by the caller.
///
/// Device-local reasons never reach the caller directly; they are folded
/// into one of these by the race coordinator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// Every device answered, and none of them holds an allowed credential.
    #[error("No eligible device: no authenticator recognised the requested credentials")]
    NoEligibleDevice,

    #[error("All devices failed")]
    AllDevicesFailed,

    #[error("Request cancelled by the user")]
    UserCancelled,

    #[error("Request timed out")]
    Timeout,
}
