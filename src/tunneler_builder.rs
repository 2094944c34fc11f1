//! Tunneler builder.
//!
//! Provides a fluent builder API for configuring endpoint instances with
//! call timeout and request expiration settings.

use crate::{Result, RpcError, Tunneler, TransportPtr};
use std::time::Duration;

/// Default broker expiration hint for published requests.
pub const DEFAULT_REQUEST_EXPIRATION: Duration = Duration::from_millis(30_000);

/// Default time a call waits for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Builder for creating [`Tunneler`] endpoints.
///
/// # Examples
///
/// ```no_run
/// use mom_tunneler::{TransportBuilder, TunnelerBuilder};
/// use std::time::Duration;
///
/// # async fn example() -> mom_tunneler::Result<()> {
/// let transport = TransportBuilder::new()
///     .uri("amqp://localhost:5672/%2f")
///     .node_id("calculator")
///     .build()
///     .await?;
///
/// let endpoint = TunnelerBuilder::new(transport)
///     .name("calculator")
///     .call_timeout(Duration::from_secs(5))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct TunnelerBuilder {
    // ---
    transport: TransportPtr,
    name: Option<String>,

    // None = default, Some(None) = no timeout
    call_timeout: Option<Option<Duration>>,
    request_expiration: Option<Duration>,
}

impl TunnelerBuilder {
    /// Create a new endpoint builder.
    ///
    /// The endpoint name defaults to `transport.transport_id()`; override
    /// with [`.name()`](Self::name) when several endpoints share a transport
    /// (common with the memory transport).
    pub fn new(transport: TransportPtr) -> Self {
        // ---
        Self {
            transport,
            name: None,
            call_timeout: None,
            request_expiration: None,
        }
    }

    /// Set the endpoint name, which is also its request channel.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set how long a call waits for its response.
    ///
    /// Default: 30s.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(Some(timeout));
        self
    }

    /// Let calls wait for their response indefinitely.
    pub fn no_call_timeout(mut self) -> Self {
        self.call_timeout = Some(None);
        self
    }

    /// Set the broker expiration hint for published requests.
    ///
    /// Default: 30s.
    pub fn request_expiration(mut self, expiration: Duration) -> Self {
        self.request_expiration = Some(expiration);
        self
    }

    /// Build the endpoint (consumes self).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidConfig`] for an empty name or a zero
    /// request expiration.
    pub fn build(self) -> Result<Tunneler> {
        // ---
        let name = self
            .name
            .unwrap_or_else(|| self.transport.transport_id().to_string());

        if name.is_empty() {
            return Err(RpcError::InvalidConfig("endpoint name must not be empty".into()));
        }

        let request_expiration = self.request_expiration.unwrap_or(DEFAULT_REQUEST_EXPIRATION);
        if request_expiration.is_zero() {
            return Err(RpcError::InvalidConfig("request expiration must be non-zero".into()));
        }

        let call_timeout = self.call_timeout.unwrap_or(Some(DEFAULT_CALL_TIMEOUT));

        Ok(Tunneler::new(name, self.transport, call_timeout, request_expiration))
    }
}
