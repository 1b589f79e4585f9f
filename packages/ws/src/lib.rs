#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! One websocket connection, from the HTTP upgrade to the last frame.
//!
//! [`handshake`] promotes an accepted socket, [`reassembler`] turns the
//! inbound frames back into whole messages, and [`stream`] ties both to a
//! per-connection outbound queue drained by its own writer task.

#[cfg(any(test, feature = "client"))]
pub mod client;
pub mod handshake;
pub mod models;
pub mod reassembler;
pub mod stream;

pub use models::{Message, OutboundPayload, PayloadError, SERVER_SENDER_ID};
pub use stream::{
    ConnectionHandle, ConnectionStream, Outbound, SinkClosed, StreamError, StreamSink,
};

/// Connection ID. Distinguishes successive connections of the same user.
pub type ConnId = u64;
