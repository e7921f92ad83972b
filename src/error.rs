//! Error types for the tio client library.

use std::time::Duration;

use crate::protocol::status;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur during client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Handshake or TCP connect failed. Fatal to the connection.
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Operation attempted on a disconnected connection.
    #[error("not connected")]
    NotConnected,

    /// The server rejected opening or creating a container.
    #[error("open '{name}' failed ({code}): {description}")]
    Open {
        name: String,
        code: i32,
        description: String,
    },

    /// Negative status from a remote call, or a malformed frame.
    #[error("protocol error ({code}): {description}")]
    Protocol { code: i32, description: String },

    /// A native value has no variant mapping.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// The container has no property with this name.
    #[error("property not found: {0}")]
    PropertyNotFound(String),

    /// No answer arrived within the configured request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure from the HTTP/JSON binding.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl ClientError {
    /// Build a protocol error with the generic protocol status code.
    pub fn protocol(description: impl Into<String>) -> Self {
        ClientError::Protocol {
            code: status::PROTOCOL,
            description: description.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> String {
        match self {
            ClientError::Connect { reason, .. } => reason.clone(),
            ClientError::NotConnected => "not connected".to_string(),
            ClientError::Open { description, .. } => description.clone(),
            ClientError::Protocol { description, .. } => description.clone(),
            ClientError::UnsupportedType(msg) => msg.clone(),
            ClientError::PropertyNotFound(name) => name.clone(),
            ClientError::Timeout(after) => format!("timed out after {:?}", after),
            ClientError::Io(e) => e.to_string(),
            ClientError::Http(e) => e.to_string(),
            ClientError::Config(e) => e.to_string(),
        }
    }

    /// Returns the remote status code, if the server reported one.
    pub fn code(&self) -> Option<i32> {
        match self {
            ClientError::Open { code, .. } | ClientError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if the connection was not (or no longer) usable.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, ClientError::NotConnected)
    }

    /// Returns true for negative remote statuses and malformed frames.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ClientError::Protocol { .. } | ClientError::PropertyNotFound(_)
        )
    }

    /// Returns true if this is a missing container property.
    pub fn is_property_not_found(&self) -> bool {
        matches!(self, ClientError::PropertyNotFound(_))
    }

    /// Returns true if this is a connection or transport error.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::NotConnected | ClientError::Io(_)
        )
    }

    /// Returns true if retrying the connect attempt could succeed.
    ///
    /// Only transport-level failures qualify; a server that answered the
    /// handshake with garbage will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Timeout(_))
            || matches!(self, ClientError::Connect { reason, .. } if !reason.starts_with("handshake"))
    }
}
