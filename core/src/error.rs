//! Crate-wide error taxonomy.
//!
//! Each subsystem owns a `thiserror` enum (`StoreError`, `ToolSourceError`, ...); this
//! module collects them into [`HostError`], whose variants are the error *kinds* named
//! in the host's error taxonomy, not a grab-bag of implementation details. Orchestrator
//! code matches on the kind to decide how to surface a failure (stream frame vs. an
//! HTTP-status-shaped value for the conventional, non-streaming paths).

use thiserror::Error;

use crate::ingest::IngestError;
use crate::provider::ProviderError;
use crate::store::StoreError;
use crate::tool_source::ToolSourceError;

/// One of the taxonomy kinds named by the host's error handling design: a request
/// failed validation, a row was missing, a write conflicted with an invariant, a path
/// escaped its confinement, an upstream collaborator (provider/embedder/network) was
/// unavailable, an operation timed out, a payload exceeded its cap, a MIME type was not
/// allowed, or something internal went wrong.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized path: {0}")]
    UnauthorizedPath(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("oversize: {0}")]
    Oversize(String),
    #[error("unsupported mime: {0}")]
    UnsupportedMime(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl HostError {
    /// Short machine-readable kind tag, e.g. for stream `end{reason:error}` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::Validation(_) => "validation",
            HostError::NotFound(_) => "not_found",
            HostError::Conflict(_) => "conflict",
            HostError::UnauthorizedPath(_) => "unauthorized_path",
            HostError::UpstreamUnavailable(_) => "upstream_unavailable",
            HostError::Timeout(_) => "timeout",
            HostError::Oversize(_) => "oversize",
            HostError::UnsupportedMime(_) => "unsupported_mime",
            HostError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for HostError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => HostError::NotFound(m),
            StoreError::Validation(m) => HostError::Validation(m),
            StoreError::Storage(m) => HostError::Internal(m),
        }
    }
}

impl From<ToolSourceError> for HostError {
    fn from(e: ToolSourceError) -> Self {
        match e {
            ToolSourceError::NotFound(m) => HostError::NotFound(m),
            ToolSourceError::InvalidInput(m) => HostError::Validation(m),
            ToolSourceError::UnauthorizedPath(m) => HostError::UnauthorizedPath(m),
            ToolSourceError::Upstream(m) => HostError::UpstreamUnavailable(m),
        }
    }
}

impl From<IngestError> for HostError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::UnsupportedMime(m) => HostError::UnsupportedMime(m),
            IngestError::Oversize(m) => HostError::Oversize(m),
            IngestError::TooManyRedirects => {
                HostError::UpstreamUnavailable("too many redirects".into())
            }
            IngestError::Timeout => HostError::Timeout("url fetch timed out".into()),
            IngestError::Network(m) => HostError::UpstreamUnavailable(m),
            IngestError::Decode(m) => HostError::Internal(m),
            IngestError::Store(e) => HostError::from(e),
        }
    }
}

impl From<ProviderError> for HostError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unavailable(m) => HostError::UpstreamUnavailable(m),
            ProviderError::Timeout => HostError::Timeout("provider call timed out".into()),
            ProviderError::Protocol(m) => HostError::Internal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_taxonomy() {
        assert_eq!(HostError::Validation("x".into()).kind(), "validation");
        assert_eq!(HostError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(HostError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(
            HostError::UnauthorizedPath("x".into()).kind(),
            "unauthorized_path"
        );
        assert_eq!(
            HostError::UpstreamUnavailable("x".into()).kind(),
            "upstream_unavailable"
        );
        assert_eq!(HostError::Timeout("x".into()).kind(), "timeout");
        assert_eq!(HostError::Oversize("x".into()).kind(), "oversize");
        assert_eq!(
            HostError::UnsupportedMime("x".into()).kind(),
            "unsupported_mime"
        );
        assert_eq!(HostError::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn store_not_found_maps_to_not_found_kind() {
        let e: HostError = StoreError::NotFound("session".into()).into();
        assert_eq!(e.kind(), "not_found");
    }
}
