use thiserror::Error;

/// Errors produced by the wsmesh protocol layer.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown cluster group: {0}")]
    ClusterGroup(String),

    #[error("connection closed")]
    Closed,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Codec(e.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
