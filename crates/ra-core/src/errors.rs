//! Unified error type for the reconfiguration agent
//!
//! Only conditions that the caller must act on are errors. Stale messages and transient
//! replica failures are absorbed by the failover unit state machine and never surface here.

use serde::{Deserialize, Serialize};

/// Unified error type for all agent operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RaError {
    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Description of the invalid input
        message: String,
    },

    /// Entity or resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Description of what was not found
        message: String,
    },

    /// Message or state older than the current configuration
    #[error("Stale: {message}")]
    Stale {
        /// Description of the stale input
        message: String,
    },

    /// Persistent store operation failed
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the store failure
        message: String,
    },

    /// Serialization or deserialization failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure
        message: String,
    },

    /// Operation was cancelled cooperatively
    #[error("Cancelled: {message}")]
    Cancelled {
        /// Description of the cancelled operation
        message: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error
        message: String,
    },
}

impl RaError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a stale input error
    pub fn stale(message: impl Into<String>) -> Self {
        Self::Stale {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error came from the persistent store
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

/// Standard Result type for agent operations
pub type Result<T> = std::result::Result<T, RaError>;

impl From<std::io::Error> for RaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RaError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<bincode::Error> for RaError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RaError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid(format!("Invalid configuration: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RaError::storage("disk full");
        assert!(err.is_storage());
        assert_eq!(err.to_string(), "Storage error: disk full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(matches!(RaError::from(io_err), RaError::NotFound { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(RaError::from(io_err), RaError::Internal { .. }));
    }

    #[test]
    fn test_toml_error_is_invalid() {
        let err = toml::from_str::<toml::Value>("= nope").unwrap_err();
        assert!(matches!(RaError::from(err), RaError::Invalid { .. }));
    }
}
