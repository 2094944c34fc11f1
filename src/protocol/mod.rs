//! Wire protocol for tunneled calls.
//!
//! Defines the JSON request/response messages exchanged between a service
//! tunnel and a service endpoint, the structured failures an endpoint
//! produces itself, and the reply channel naming convention.
mod message;

pub use message::{
    //
    failure_to_error,
    FailureBody,
    RequestMessage,
    ResponseMessage,
    INVALID_PAYLOAD,
    INVALID_RESULT,
    UNKNOWN_PROCEDURE,
};

use uuid::Uuid;

/// Name of the private reply channel a client endpoint `local` uses for
/// calls to `remote`: `<remote>::<local>/<uuid>`.
pub fn reply_channel_name(remote: &str, local: &str) -> String {
    // ---
    format!("{remote}::{local}/{}", Uuid::new_v4())
}
