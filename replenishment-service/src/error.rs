use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream credentials not configured")]
    MissingCredentials,

    #[error("{path} unavailable after {attempts} attempts")]
    Unavailable { path: String, attempts: u32 },

    #[error("{path} returned {status}")]
    Status { path: String, status: u16 },

    #[error("failed to decode upstream payload: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection failed: {0}")]
    Connection(String),

    #[error("cache operation failed: {0}")]
    Backend(String),

    #[error("cache serialization failed: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("dashboard unavailable: {0}")]
    Unavailable(String),
}
