use thiserror::Error;

/// Failure taxonomy for every public SDK operation. Local-validation and
/// state-precondition variants are raised before any network call is made.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("chat application is inactive")]
    ConfigInactive,
    #[error("missing required field `{field}`")]
    MissingRequiredField { field: String },
    #[error("client is not initialized; call initialize() first")]
    NotInitialized,
    #[error("no browser identity registered for this session")]
    NotRegistered,
    #[error("request timed out")]
    Timeout,
    #[error("network failure: {0}")]
    Network(String),
    #[error("server rejected request ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("malformed server response: {0}")]
    MalformedResponse(String),
    #[error("upload was cancelled")]
    UploadCancelled,
    #[error("local storage failure: {0}")]
    Storage(String),
}
