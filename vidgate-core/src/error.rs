use thiserror::Error;

/// Storage-layer failures.
///
/// `ValueTooLarge` and `RateLimited` are distinguished variants: the
/// orchestrator routes size rejections to the no-store fallback path, and
/// the TTL refresher retries rate limits only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("value of {size} bytes exceeds the {limit} byte limit")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("backend rate limited")]
    RateLimited,

    #[error("operation timed out")]
    Timeout,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::Server(redis::ServerErrorKind::TryAgain) {
            return StorageError::RateLimited;
        }
        if err.is_timeout() {
            return StorageError::Timeout;
        }
        StorageError::Backend(err.to_string())
    }
}

/// Error taxonomy of the delivery pipeline.
///
/// Only `Validation` and the upstream variants are ever surfaced to the
/// client; storage, version and refresh failures are logged and swallowed
/// by their callers.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid {param}: {reason}")]
    Validation { param: String, reason: String },

    #[error("upstream transform returned {status}: {message}")]
    UpstreamTransform { status: u16, message: String },

    #[error("upstream fetch failed: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("range not satisfiable: {0}")]
    Range(String),

    #[error("coalesced fetch failed: leader dropped or panicked")]
    Coalescing,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            param: param.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_names_parameter() {
        let err = Error::validation("duration", "must be positive");
        assert_eq!(err.to_string(), "invalid duration: must be positive");
    }

    #[test]
    fn test_storage_error_is_cloneable_for_coalescing() {
        let err = Error::Storage(StorageError::ValueTooLarge {
            size: 30_000_000,
            limit: 26_214_400,
        });
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
