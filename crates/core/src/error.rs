//! Error taxonomy (spec §7). One enum per failure domain; each is carried
//! verbatim on the owning node/cache-entry rather than retried, except for
//! the single bounded retry on `CrawlError::Timeout`.

use std::sync::Arc;

/// Raised while compiling a path template, before a mount is ever attempted.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template token '{0}'")]
    UnknownToken(String),
    #[error("unbalanced braces in template segment '{0}'")]
    UnbalancedBraces(String),
    #[error("empty path segment (two consecutive '/' or leading/trailing '/')")]
    EmptySegment,
    #[error("template must not start with '/'")]
    LeadingSlash,
    #[error("template must not end with '/'")]
    TrailingSlash,
    #[error("template is empty")]
    Empty,
    #[error(
        "segment {segment_index} references level {referenced:?} before it is bound (current max bound level is {bound_through:?})"
    )]
    LevelOutOfOrder {
        segment_index: usize,
        referenced: crate::entity::Level,
        bound_through: Option<crate::entity::Level>,
    },
}

/// Credentials rejected by the remote service. Surfaced to the launcher; the
/// mount attempt aborts. studip-fuse does not itself implement any
/// authentication flow (spec §1 out-of-scope) — this variant exists so the
/// `Crawler` can report what an `AuthProvider` collaborator tells it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("authentication rejected by remote service: {0}")]
pub struct AuthError(pub String);

/// Per-request failures from the REST surface (spec §4.4, §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CrawlError {
    #[error("request timed out")]
    Timeout,
    #[error("remote service returned HTTP {0}")]
    HttpStatus(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("required endpoint is missing from discovery document: {0}")]
    EndpointMissing(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Terminal state of a `VirtualNode` expansion (spec §4.3).
#[derive(Debug, Clone, thiserror::Error)]
#[error("directory could not be expanded: {0}")]
pub struct NodeExpansionError(pub Arc<CrawlError>);

impl From<CrawlError> for NodeExpansionError {
    fn from(err: CrawlError) -> Self {
        NodeExpansionError(Arc::new(err))
    }
}

/// Local disk failures from the content cache (spec §4.5).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("local disk I/O error: {0}")]
    Io(String),
    #[error(transparent)]
    Crawl(#[from] CrawlError),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}
