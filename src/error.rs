//! Error kinds surfaced by the proxy, the certificate issuer and the record store.

use hyper::StatusCode;
use thiserror::Error;

/// Per-transaction failures. Each variant maps onto the status the proxy
/// client observes; none of them unwind past a single connection.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed client input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The origin could not be determined or reached.
    #[error("no upstream for {target}: {reason}")]
    NoUpstream { target: String, reason: String },

    /// TLS handshake with the client or the origin failed.
    #[error("TLS handshake failed for {target}: {reason}")]
    HandshakeFailed { target: String, reason: String },

    /// Leaf certificate could not be minted.
    #[error(transparent)]
    CaUnusable(#[from] IssueError),

    /// Persistence failure; logged, never surfaced to the proxy client.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProxyError {
    pub fn no_upstream(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::NoUpstream {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn handshake(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::HandshakeFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoUpstream { .. } | Self::HandshakeFailed { .. } | Self::CaUnusable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short diagnostic body written to the proxy client.
    pub fn public_message(&self) -> String {
        match self {
            Self::BadRequest(reason) => reason.clone(),
            Self::NoUpstream { .. } | Self::CaUnusable(_) => "no upstream".to_owned(),
            Self::HandshakeFailed { .. } => "handshake".to_owned(),
            Self::Store(_) => "internal error".to_owned(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IssueError {
    #[error("leaf certificate needs at least one usable name: {0}")]
    BadName(String),

    #[error("CA cannot sign leaf certificate for `{name}`: {reason}")]
    CaUnusable { name: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("request {0} was not found")]
    NotFound(i64),

    #[error("a response for request {0} already exists")]
    Duplicate(i64),

    #[error("record store: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}
