//! Calling side of a tunnel.
//!
//! A [`ServiceTunnel`] sends requests to one remote service and matches the
//! responses arriving on its private reply channel to the waiting callers.
mod pending;

pub use pending::{PendingCall, PendingCalls};

use crate::protocol::{failure_to_error, reply_channel_name, RequestMessage, ResponseMessage};
use crate::{
    // ---
    Address,
    CorrelationId,
    Envelope,
    MessageHandler,
    PublishOptions,
    Result,
    RpcError,
    SubscribeOptions,
    Subscription,
    TransportPtr,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Client handle for calling procedures of one remote service.
///
/// Cheap to clone; clones share the reply channel and the pending calls.
/// Obtain one with [`Tunneler::service_tunnel`](crate::Tunneler::service_tunnel).
#[derive(Clone)]
pub struct ServiceTunnel {
    inner: Arc<Inner>,
}

struct Inner {
    service: String,
    reply_channel: String,
    transport: TransportPtr,
    pending: PendingCalls<Value>,
    request_expiration: Duration,
}

impl ServiceTunnel {
    // ---

    /// Create a tunnel to `service` on behalf of endpoint `local`.
    ///
    /// Declares the service's request channel, so requests wait there until
    /// the service starts consuming, and subscribes to the reply channel.
    ///
    /// Calls are rejected with [`RpcError::Timeout`] after `call_timeout`,
    /// if set. Requests are published with `request_expiration` as the
    /// broker expiration hint.
    pub async fn open(
        transport: TransportPtr,
        service: &str,
        local: &str,
        call_timeout: Option<Duration>,
        request_expiration: Duration,
    ) -> Result<Self> {
        // ---
        let reply_channel = reply_channel_name(service, local);
        let pending = PendingCalls::new(call_timeout);

        let consumer = Arc::new(ReplyConsumer {
            pending: pending.clone(),
        });

        transport
            .declare(Address::from(service), SubscribeOptions::request_channel())
            .await?;

        transport
            .subscribe(
                Subscription::from(reply_channel.as_str()),
                consumer,
                SubscribeOptions::reply_channel(),
            )
            .await?;

        crate::log_debug!("service tunnel to {service} listening on {reply_channel}");

        Ok(Self {
            inner: Arc::new(Inner {
                service: service.to_string(),
                reply_channel,
                transport,
                pending,
                request_expiration,
            }),
        })
    }

    /// Name of the remote service.
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Private reply channel this tunnel listens on.
    pub fn reply_channel(&self) -> &str {
        &self.inner.reply_channel
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Call `procedure` with a raw JSON payload.
    ///
    /// A `null` payload is sent as no payload. Resolves with the handler's
    /// result value, or fails with the handler's failure value
    /// ([`RpcError::Remote`]), [`RpcError::UnknownProcedure`],
    /// [`RpcError::Timeout`] or the publish error.
    pub async fn send(&self, procedure: &str, payload: Value) -> Result<Value> {
        // ---
        let call = self.inner.pending.create(CorrelationId::generate())?;
        self.dispatch(call, procedure, payload).await
    }

    /// Same as [`send`](Self::send) with a per-call timeout (`None` waits
    /// indefinitely).
    pub async fn send_with_timeout(
        &self,
        procedure: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        // ---
        let call = self
            .inner
            .pending
            .create_with_timeout(CorrelationId::generate(), timeout)?;
        self.dispatch(call, procedure, payload).await
    }

    /// Typed call: serializes `req` and deserializes the result into `TResp`.
    pub async fn call<TReq, TResp>(&self, procedure: &str, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let payload = serde_json::to_value(req)?;
        let response = self.send(procedure, payload).await?;
        Ok(serde_json::from_value(response)?)
    }

    // The call is registered before publishing so an immediate reply cannot
    // be missed. On a publish error `call` is dropped, which releases it.
    async fn dispatch(
        &self,
        call: PendingCall<Value>,
        procedure: &str,
        payload: Value,
    ) -> Result<Value> {
        // ---
        let payload = match payload {
            Value::Null => None,
            other => Some(other),
        };

        let request = RequestMessage::new(
            call.id().clone(),
            procedure,
            payload,
            self.inner.reply_channel.as_str(),
        );
        let env = Envelope::json(Address::from(self.inner.service.as_str()), &request)?;
        let opts = PublishOptions::with_expiration(self.inner.request_expiration);

        if let Err(e) = self.inner.transport.publish(env, opts).await {
            crate::log_debug!("request {} to {} not sent: {e}", call.id(), self.inner.service);
            return Err(e);
        }

        call.await
    }

    /// Reject every pending call with `make_error`. Returns how many were
    /// rejected.
    pub fn reject_pending<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> RpcError,
    {
        self.inner.pending.reject_all(make_error)
    }
}

// Resolves pending calls from responses arriving on the reply channel
struct ReplyConsumer {
    pending: PendingCalls<Value>,
}

#[async_trait::async_trait]
impl MessageHandler for ReplyConsumer {
    async fn handle(&self, env: Envelope) -> Result<()> {
        // ---
        let response: ResponseMessage = match env.decode() {
            Ok(response) => response,
            Err(e) => {
                crate::log_warn!("dropping undecodable response on {}: {e}", env.address);
                return Ok(());
            }
        };

        let cid = response.cid.clone();
        let settled = match response.into_outcome() {
            Ok(value) => self.pending.resolve(&cid, value),
            Err(error) => self.pending.reject(&cid, failure_to_error(error)),
        };

        if !settled {
            crate::log_debug!("no pending call for correlation id {cid}");
        }
        Ok(())
    }
}
