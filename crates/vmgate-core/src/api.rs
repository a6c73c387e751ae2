use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport selector used by the forwarder control endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl Default for TransportProtocol {
    fn default() -> Self {
        TransportProtocol::Tcp
    }
}

/// Body of `POST /services/forwarder/expose`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposeRequest {
    pub local: String,
    pub remote: String,
    #[serde(default)]
    pub protocol: TransportProtocol,
}

/// Body of `POST /services/forwarder/unexpose`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnexposeRequest {
    pub local: String,
    #[serde(default)]
    pub protocol: TransportProtocol,
}

/// An active host listener, as reported by `/services/forwarder/all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardEntry {
    pub local: String,
    pub remote: String,
    pub protocol: TransportProtocol,
}

/// Structured error body returned by the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{local} is already exposed")]
    AlreadyExposed { local: String },
    #[error("{local} is not exposed")]
    NotExposed { local: String },
    #[error("udp forwards are not supported")]
    UnsupportedProtocol,
    #[error("invalid local address {local}: {reason}")]
    InvalidLocal { local: String, reason: String },
    #[error("invalid remote address {remote}: {reason}")]
    InvalidRemote { remote: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
