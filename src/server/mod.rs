//! Service endpoint side of a tunnel.
//!
//! The [`Dispatcher`] owns the table of procedure handlers and turns one
//! request into one response. [`RequestConsumer`] binds a dispatcher to a
//! transport: it decodes request envelopes, dispatches them and publishes
//! the response to the requester's reply channel.
mod handler;

pub use handler::{BoxFuture, HandlerMap, HandlerOutcome, ProcedureHandler, ProcedureHandlerPtr};

use crate::protocol::{RequestMessage, ResponseMessage};
use crate::{Address, Envelope, MessageHandler, PublishOptions, Result, TransportPtr};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Handler table keyed by procedure name.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, ProcedureHandlerPtr>>,
}

impl Dispatcher {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ProcedureHandlerPtr>> {
        match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ProcedureHandlerPtr>> {
        match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Merge `handlers` into the table. A name that is already registered
    /// is replaced.
    pub fn register(&self, handlers: HandlerMap) {
        // ---
        let mut table = self.write();
        for (procedure, handler) in handlers {
            if table.insert(procedure.clone(), handler).is_some() {
                crate::log_debug!("replaced handler for procedure {procedure}");
            }
        }
    }

    pub fn contains(&self, procedure: &str) -> bool {
        self.read().contains_key(procedure)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the handler named by `request` and build the matching response.
    ///
    /// An unknown procedure yields an `unknown-procedure` failure rather than
    /// an error, so the caller is always answered.
    pub async fn dispatch(&self, request: RequestMessage) -> ResponseMessage {
        // ---
        let RequestMessage {
            cid,
            procedure,
            payload,
            ..
        } = request;

        // Look up handler; the guard must not live across the await below.
        let handler = self.read().get(&procedure).cloned();

        let Some(handler) = handler else {
            crate::log_debug!("no handler for procedure: {procedure}");
            return ResponseMessage::unknown_procedure(cid, &procedure);
        };

        match handler.call(payload.unwrap_or(Value::Null)).await {
            Ok(response) => ResponseMessage::success(cid, response),
            Err(error) => ResponseMessage::failure(cid, error),
        }
    }
}

/// Transport handler for an endpoint's request channel.
pub struct RequestConsumer {
    dispatcher: Arc<Dispatcher>,
    transport: TransportPtr,
}

impl RequestConsumer {
    pub fn new(dispatcher: Arc<Dispatcher>, transport: TransportPtr) -> Self {
        Self {
            dispatcher,
            transport,
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for RequestConsumer {
    /// Dispatch one request and publish its response.
    ///
    /// Undecodable requests are dropped (`Ok`), a failed response publish is
    /// returned so the request is redelivered.
    async fn handle(&self, env: Envelope) -> Result<()> {
        // ---
        let request: RequestMessage = match env.decode() {
            Ok(request) => request,
            Err(e) => {
                crate::log_warn!("dropping undecodable request on {}: {e}", env.address);
                return Ok(());
            }
        };

        let reply_to = Address::from(request.response_queue.as_str());
        let response = self.dispatcher.dispatch(request).await;

        let response_env = match Envelope::json(reply_to, &response) {
            Ok(env) => env,
            Err(e) => {
                crate::log_error!("dropping unencodable response {}: {e}", response.cid);
                return Ok(());
            }
        };

        self.transport
            .publish(response_env, PublishOptions::default())
            .await
            .inspect_err(|e| {
                crate::log_error!("failed to publish response {}: {e}", response.cid);
            })
    }
}
