use thiserror::Error;

/// Canonical packflow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`PfwError::InvalidInput`]: dataset/element attributes out of contract
///   before any worker is contacted
/// - [`PfwError::LookupFailed`]: an element URL could not be resolved to an
///   end-point
/// - [`PfwError::ValidationFailed`]: a worker could not count entries for an
///   element (recoverable per element)
/// - [`PfwError::WorkerLost`]: transport error or fatal reply; the query is
///   unreliable from this point on
/// - [`PfwError::Protocol`]: unexpected reply type that persisted after the
///   drain of log traffic
/// - [`PfwError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum PfwError {
    /// Invalid or inconsistent dataset/request state.
    ///
    /// Examples:
    /// - empty dataset, or no valid element left after validation
    /// - element range attributes out of contract (`first < 0`, `num < -1`)
    /// - friend set with mismatched cardinality
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An element URL could not be resolved to an end-point URL.
    #[error("lookup failed: {0}")]
    LookupFailed(String),

    /// A worker could not produce an entry count for an element.
    ///
    /// Recovered per element: the element is dropped and the query
    /// continues with the rest.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A worker channel broke or the worker sent a fatal reply.
    ///
    /// The whole query is marked invalid; results are unreliable.
    #[error("worker lost: {0}")]
    WorkerLost(String),

    /// Unexpected reply type after draining log traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard packflow result alias.
pub type Result<T> = std::result::Result<T, PfwError>;
