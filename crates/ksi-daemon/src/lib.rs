//! KSI Daemon - assembly of the full stack behind `ksid`.
//!
//! The binary is a thin shell over [`bootstrap`]: tests and embedders
//! assemble the same stack in-process (optionally injecting their own
//! provider drivers) and drive it over the real socket.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bootstrap;
pub mod handlers;
