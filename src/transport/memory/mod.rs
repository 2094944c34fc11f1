// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for channel semantics.
//!
//! ## Reference Semantics
//!
//! - Once `subscribe()` returns successfully, messages already queued on the
//!   channel and messages published afterwards are delivered to the handler.
//! - No messages are dropped due to timing, scheduling, or background IO,
//!   except those whose expiration passed while nobody consumed the channel.
//!
//! ## Non-Goals
//!
//! This transport does not attempt to emulate persistence, redelivery or the
//! connection failures of a real broker.

mod transport;

pub use transport::create_transport;
