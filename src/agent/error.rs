//! Error types for the device agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// The persisted record failed its checksum or could not be decoded.
    #[error("Stored record is corrupt: {0}")]
    StorageCorruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Server rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No usable identity or network credentials; the device must be provisioned.
    #[error("Device not provisioned: {0}")]
    NotProvisioned(String),
}

impl AgentError {
    /// The server refused our identity or secret.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, AgentError::Rejected { status: 401 | 404, .. })
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentError::Timeout
        } else if let Some(status) = err.status() {
            AgentError::Rejected {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            AgentError::Unreachable(err.to_string())
        }
    }
}
