//! Error types for kim-snatch

use std::io;

use thiserror::Error;

/// Result type alias for kim-snatch
pub type Result<T> = std::result::Result<T, Error>;

/// kim-snatch errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup error (listener, rustls config)
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate material could not be read, parsed or validated
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the failed operation could succeed.
    ///
    /// Used by the CA injector's backoff loop: API-server hiccups are retried,
    /// malformed data is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 409,
            Self::Kube(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_errors_are_not_transient() {
        assert!(!Error::Certificate("key mismatch".into()).is_transient());
    }

    #[test]
    fn io_errors_are_transient() {
        let e = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(e.is_transient());
    }

    #[test]
    fn display_includes_category() {
        let e = Error::Config("pool must not be empty".into());
        assert_eq!(e.to_string(), "Configuration error: pool must not be empty");
    }
}
