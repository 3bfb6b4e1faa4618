use thiserror::Error;

/// Failures that terminate a unit of work instead of being contained as
/// data. Per-item index failures and per-artifact write failures are
/// reported inline by their owners and never surface through this type.
#[derive(Debug, Error)]
pub enum SpecrunError {
    /// The requested script id, or the specification it targets, resolved
    /// to nothing. Fatal to the run.
    #[error("script or specification not found: {0}")]
    NotFound(String),

    /// An RPC message carried a type tag outside the dispatch table. The
    /// connection survives; the caller gets a failure response.
    #[error("unknown message type {0}")]
    UnknownOperation(String),
}
