//! KSI Transport - framed JSON over a local Unix stream socket.
//!
//! Framing is a 4-byte big-endian length prefix followed by UTF-8 JSON.
//! One accept loop; per connection one reader task feeding a bounded
//! inbound channel (overruns answer the client with `capacity`) and one
//! writer task draining responses plus the connection's subscription
//! queue. Every inbound frame is stamped with the connection's
//! `client_id` before it reaches the router.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod client;
mod error;
mod framing;
mod monitor;
mod server;

pub use client::TransportClient;
pub use error::{TransportError, TransportResult};
pub use framing::{read_frame, write_frame};
pub use monitor::register_monitor_handlers;
pub use server::{ClientRegistry, TransportServer};
