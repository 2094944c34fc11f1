use crate::{CorrelationId, RpcError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Failure kind sent when a request names a procedure with no handler.
pub const UNKNOWN_PROCEDURE: &str = "unknown-procedure";

/// Failure kind sent when a typed handler cannot decode its payload.
pub const INVALID_PAYLOAD: &str = "invalid-payload";

/// Failure kind sent when a typed handler's result or failure value cannot
/// be encoded as JSON.
pub const INVALID_RESULT: &str = "invalid-result";

/// Keeps an explicit JSON `null` as `Some(Value::Null)`; only a missing
/// field becomes `None` (via `#[serde(default)]`).
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Request sent from a service tunnel to a service's request channel.
///
/// Wire form: `{ "cid", "type", "payload"?, "responseQueue" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub cid: CorrelationId,

    /// Name of the procedure to invoke.
    #[serde(rename = "type")]
    pub procedure: String,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub payload: Option<Value>,

    /// Channel the response must be published to.
    #[serde(rename = "responseQueue")]
    pub response_queue: String,
}

impl RequestMessage {
    pub fn new(
        cid: CorrelationId,
        procedure: impl Into<String>,
        payload: Option<Value>,
        response_queue: impl Into<String>,
    ) -> Self {
        // ---
        Self {
            cid,
            procedure: procedure.into(),
            payload,
            response_queue: response_queue.into(),
        }
    }
}

/// Response published to the requester's reply channel.
///
/// Wire form: `{ "cid", "response"?, "error"? }`. The constructors guarantee
/// that at most one of `response` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub cid: CorrelationId,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub response: Option<Value>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub error: Option<Value>,
}

impl ResponseMessage {
    // ---
    /// Successful response carrying the handler's return value.
    pub fn success(cid: CorrelationId, response: Value) -> Self {
        Self {
            cid,
            response: Some(response),
            error: None,
        }
    }

    /// Failed response carrying the failure value unmodified.
    pub fn failure(cid: CorrelationId, error: Value) -> Self {
        Self {
            cid,
            response: None,
            error: Some(error),
        }
    }

    /// Failed response for a procedure the endpoint has no handler for.
    pub fn unknown_procedure(cid: CorrelationId, procedure: &str) -> Self {
        Self::failure(cid, FailureBody::unknown_procedure(procedure).to_value())
    }

    /// Split into the call outcome. A present `error` wins; a response with
    /// neither field resolves to `null`.
    pub fn into_outcome(self) -> std::result::Result<Value, Value> {
        // ---
        match (self.error, self.response) {
            (Some(error), _) => Err(error),
            (None, response) => Ok(response.unwrap_or(Value::Null)),
        }
    }
}

/// Structured failure produced by the endpoint itself (as opposed to a
/// failure value returned by a handler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBody {
    pub kind: String,
    pub procedure: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FailureBody {
    pub fn unknown_procedure(procedure: &str) -> Self {
        Self {
            kind: UNKNOWN_PROCEDURE.to_string(),
            procedure: procedure.to_string(),
            message: None,
        }
    }

    pub fn invalid_payload(procedure: &str, message: impl Into<String>) -> Self {
        Self {
            kind: INVALID_PAYLOAD.to_string(),
            procedure: procedure.to_string(),
            message: Some(message.into()),
        }
    }

    pub fn invalid_result(procedure: &str, message: impl Into<String>) -> Self {
        Self {
            kind: INVALID_RESULT.to_string(),
            procedure: procedure.to_string(),
            message: Some(message.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        // ---
        let mut body = serde_json::json!({
            "kind": self.kind,
            "procedure": self.procedure,
        });
        if let Some(message) = &self.message {
            body["message"] = Value::from(message.as_str());
        }
        body
    }
}

/// Map a failure value received in a response to the caller-facing error.
///
/// `unknown-procedure` bodies become [`RpcError::UnknownProcedure`]; every
/// other value is forwarded verbatim as [`RpcError::Remote`].
pub fn failure_to_error(error: Value) -> RpcError {
    // ---
    let unknown = error.get("kind").and_then(Value::as_str) == Some(UNKNOWN_PROCEDURE);
    if unknown {
        if let Some(procedure) = error.get("procedure").and_then(Value::as_str) {
            return RpcError::UnknownProcedure(procedure.to_string());
        }
    }
    RpcError::Remote(error)
}
