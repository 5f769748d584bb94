//! Client-side error type.
//!
//! Cluster errors pass through untouched — the taxonomy in
//! `rangestream_core::Error` is what callers match on (`DataLoss` is
//! terminal, `Unavailable` after retries means the budget ran out, and so
//! on). The client adds only configuration mistakes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// An error from the cluster, unchanged.
    #[error(transparent)]
    Cluster(#[from] rangestream_core::Error),

    /// The builder was misconfigured.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// The underlying cluster error, when there is one.
    pub fn as_cluster(&self) -> Option<&rangestream_core::Error> {
        match self {
            ClientError::Cluster(e) => Some(e),
            ClientError::Config(_) => None,
        }
    }
}
