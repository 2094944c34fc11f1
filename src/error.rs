use thiserror::Error;

/// Errors that can occur during tunneled RPC operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// No response arrived within the call timeout.
    ///
    /// The remote side may still process the request; its late response is
    /// dropped on arrival.
    #[error("request timed out")]
    Timeout,

    /// A publish was attempted while the transport is not connected.
    #[error("transport disconnected")]
    Disconnected,

    /// The remote endpoint has no handler for the requested procedure.
    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),

    /// The remote handler failed; carries its failure value verbatim.
    #[error("remote handler failed: {0}")]
    Remote(serde_json::Value),

    /// A pending call is already registered under this correlation id.
    #[error("correlation id already pending: {0}")]
    DuplicateCorrelationId(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport or broker level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A required configuration value was not provided
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// A configuration value was rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The endpoint or transport has been closed
    #[error("closed")]
    Closed,
}

/// Result type alias for tunneler operations
pub type Result<T> = std::result::Result<T, RpcError>;
