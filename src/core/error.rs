use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session or expiration entry not found")]
    NotFound,

    #[error("operation not implemented by the session database")]
    NotImplemented,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bucket error: {0}")]
    Bucket(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("session database is closed")]
    Closed,
}

impl SessionError {
    /// Whether this is the `NotFound` variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Whether this is the `NotImplemented` variant.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented)
    }

    /// Status code a request handler should answer with when an expiration
    /// update fails with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::NOT_MODIFIED,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl<T> From<std::sync::PoisonError<T>> for SessionError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(SessionError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            SessionError::NotImplemented.status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            SessionError::Io("disk full".into()).status_code(),
            StatusCode::NOT_MODIFIED
        );
    }

    #[test]
    fn test_poison_error_maps_to_lock_error() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: SessionError = lock.lock().unwrap_err().into();
        assert!(matches!(err, SessionError::Lock(_)));
    }
}
