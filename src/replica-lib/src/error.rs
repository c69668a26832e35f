use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("HTTP error: {code} for {info}")]
    HttpStatus { code: u16, info: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cycle aborted: {0}")]
    CycleAborted(String),
}

impl ReplicaError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => ReplicaError::NotFound(info),
            _ => ReplicaError::HttpStatus {
                code: code.as_u16(),
                info,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReplicaError::NotFound(_))
    }

    /// Transient failures worth another attempt. A definitive client error
    /// (4xx other than 408/429) is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicaError::RemoteError(_)
            | ReplicaError::Timeout(_)
            | ReplicaError::IoError(_)
            | ReplicaError::DbError(_) => true,
            ReplicaError::HttpStatus { code, .. } => {
                *code >= 500 || *code == 408 || *code == 429
            }
            _ => false,
        }
    }
}

pub type ReplicaResult<T> = std::result::Result<T, ReplicaError>;

impl From<std::io::Error> for ReplicaError {
    fn from(err: std::io::Error) -> Self {
        ReplicaError::IoError(err.to_string())
    }
}

impl From<rusqlite::Error> for ReplicaError {
    fn from(err: rusqlite::Error) -> Self {
        ReplicaError::DbError(err.to_string())
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(err: serde_json::Error) -> Self {
        ReplicaError::DecodeError(err.to_string())
    }
}
