use crate::protocol::FailureBody;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one procedure invocation: the result value, or the failure
/// value that is forwarded verbatim to the caller.
pub type HandlerOutcome = std::result::Result<Value, Value>;

/// Type-erased procedure handler.
///
/// Handlers of different request/response types are stored in the same map
/// behind this trait. `call` receives the request payload (`null` when the
/// request carried none) and may complete asynchronously.
pub trait ProcedureHandler: Send + Sync {
    fn call(&self, payload: Value) -> BoxFuture<'static, HandlerOutcome>;
}

/// Shared handler pointer; cloned out of the handler table per dispatch.
pub type ProcedureHandlerPtr = Arc<dyn ProcedureHandler>;

// Handler working on raw JSON values
struct RawHandler<F> {
    func: F,
}

impl<F, Fut> ProcedureHandler for RawHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn call(&self, payload: Value) -> BoxFuture<'static, HandlerOutcome> {
        Box::pin((self.func)(payload))
    }
}

// Handler with typed request, response and failure values
struct TypedHandler<F, TReq, TResp, TErr> {
    procedure: Arc<str>,
    func: F,
    _phantom: PhantomData<fn(TReq) -> (TResp, TErr)>,
}

impl<F, Fut, TReq, TResp, TErr> ProcedureHandler for TypedHandler<F, TReq, TResp, TErr>
where
    F: Fn(TReq) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<TResp, TErr>> + Send + 'static,
    TReq: DeserializeOwned,
    TResp: Serialize,
    TErr: Serialize,
{
    fn call(&self, payload: Value) -> BoxFuture<'static, HandlerOutcome> {
        // Deserialize request
        let req: TReq = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                let failure = FailureBody::invalid_payload(&self.procedure, e.to_string());
                return Box::pin(async move { Err(failure.to_value()) });
            }
        };

        // Call handler
        let fut = (self.func)(req);
        let procedure = Arc::clone(&self.procedure);

        Box::pin(async move {
            let encode = |result: std::result::Result<Value, serde_json::Error>| {
                result.map_err(|e| FailureBody::invalid_result(&procedure, e.to_string()).to_value())
            };

            match fut.await {
                Ok(resp) => encode(serde_json::to_value(resp)),
                Err(err) => Err(encode(serde_json::to_value(err))?),
            }
        })
    }
}

/// A set of named procedure handlers, merged into an endpoint with
/// [`Tunneler::handle_messages`](crate::Tunneler::handle_messages).
///
/// # Example
///
/// ```
/// use mom_tunneler::HandlerMap;
/// use serde_json::{json, Value};
///
/// let handlers = HandlerMap::new()
///     .procedure("square", |x: i64| async move { Ok::<_, String>(x * x) })
///     .raw("echo", |payload: Value| async move { Ok(payload) })
///     .raw("fail", |_| async move { Err(json!("error")) });
///
/// assert_eq!(handlers.len(), 3);
/// ```
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: HashMap<String, ProcedureHandlerPtr>,
}

impl HandlerMap {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler working on raw JSON values.
    ///
    /// The `Err` value is sent to the caller unmodified.
    pub fn raw<F, Fut>(mut self, procedure: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        // ---
        self.insert(procedure, Arc::new(RawHandler { func: handler }));
        self
    }

    /// Add a typed handler.
    ///
    /// The payload is deserialized into `TReq`; a payload that does not fit
    /// fails the call with an `invalid-payload` failure. The `Err` value is
    /// serialized and sent to the caller as the failure.
    pub fn procedure<TReq, TResp, TErr, F, Fut>(mut self, procedure: &str, handler: F) -> Self
    where
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        TErr: Serialize + Send + 'static,
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TResp, TErr>> + Send + 'static,
    {
        // ---
        let handler_obj = TypedHandler {
            procedure: Arc::from(procedure),
            func: handler,
            _phantom: PhantomData,
        };
        self.insert(procedure, Arc::new(handler_obj));
        self
    }

    /// Add an already type-erased handler. Replaces any handler of the same name.
    pub fn insert(&mut self, procedure: &str, handler: ProcedureHandlerPtr) {
        self.handlers.insert(procedure.to_string(), handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl IntoIterator for HandlerMap {
    type Item = (String, ProcedureHandlerPtr);
    type IntoIter = std::collections::hash_map::IntoIter<String, ProcedureHandlerPtr>;

    fn into_iter(self) -> Self::IntoIter {
        self.handlers.into_iter()
    }
}
