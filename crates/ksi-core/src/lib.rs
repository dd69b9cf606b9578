//! KSI Core - shared types for the KSI daemon.
//!
//! This crate provides:
//! - The [`Event`] envelope and its system-managed [`EventContext`]
//! - Newtype ids for every addressable thing in the system
//! - The wire error taxonomy ([`ErrorKind`], [`KsiError`])
//! - Capability names and sets consulted by the router
//!
//! # Context discipline
//!
//! `EventContext` is only ever constructed by the router: [`EventContext::root`]
//! at ingress and [`EventContext::child_of`] for events emitted while handling
//! another event. Context arriving on the wire is discarded. Handlers read
//! context; they never write it.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod capability;
mod error;
mod event;
mod id;

pub use capability::{Capability, CapabilitySet};
pub use error::{ErrorBody, ErrorFrame, ErrorKind, KsiError, KsiResult};
pub use event::{Event, EventContext, EventName, EventOrigin};
pub use id::{
    AgentId, ClientId, CorrelationId, EventId, OrchestrationId, RequestId, SandboxId, SessionId,
    SubscriberId,
};
