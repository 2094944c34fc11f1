//! Reconnecting broker transport.
//!
//! [`ResilientTransport`] implements the domain `Transport` trait on top of
//! any broker reachable through a [`Connector`]. It owns the connection
//! lifecycle (connect, fixed-delay reconnect, subscription replay) so broker
//! adapters only have to provide a single [`BrokerSession`].
//!
//! The AMQP adapter under `transport::amqp` is one such connector; tests
//! drive the same state machine with an in-process broker.

mod session;
mod transport;

pub use session::{Acker, BrokerSession, ConsumerHandle, Connector, Delivery, SessionPtr};
pub use transport::ResilientTransport;
