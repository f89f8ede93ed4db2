//! Connector error taxonomy
//!
//! Each layer owns its error enum (`TokenError`, `TransportError`,
//! `DirectoryError`, `ConfigError`); [`ConnectorError`] folds them into the
//! outcome a caller of the connector sees.

use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::token::TokenError;
use crate::transport::TransportError;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Credential issuance failed: {0}")]
    Issuance(#[from] TokenError),

    #[error("Connection attempt failed: {0}")]
    Connect(#[source] TransportError),

    #[error("Publish failed: {0}")]
    Publish(#[source] TransportError),

    /// `last` is shared so every later call on an exhausted connector can
    /// still report the failure that depleted the budget
    #[error("Connection retry budget exhausted after {attempts} attempts")]
    ExhaustedRetry {
        attempts: u32,
        #[source]
        last: Option<Arc<TransportError>>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl ConnectorError {
    /// True once the connector refuses further connection attempts
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectorError::ExhaustedRetry { .. })
    }

    /// Create an exhausted-retry error
    pub fn exhausted(attempts: u32, last: Option<Arc<TransportError>>) -> Self {
        Self::ExhaustedRetry { attempts, last }
    }
}

/// Result type alias for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;
