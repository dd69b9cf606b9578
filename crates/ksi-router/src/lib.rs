//! KSI Router - the event router at the heart of the daemon.
//!
//! Every capability of the system is a named event dispatched through
//! here. The router owns:
//!
//! - the **handler registry** with declarative parameter schemas
//! - the single **dispatch loop** that stamps context, enforces agent
//!   capabilities, appends the event log, synthesizes transformer events,
//!   fans out subscriptions and bubbles events up orchestration trees
//! - the **event log** (append-only NDJSON, daily rotation, sidecar
//!   offset index in the store)
//! - **transformers** (declarative YAML routing rules, hot-swappable)
//! - **subscriptions** (glob patterns, scopes, bounded evicting delivery)
//! - **discovery** (`system:discover` / `system:help` over the registry)
//!
//! # Ordering
//!
//! The dispatch loop is the serialization point: global event order is
//! the log's append sequence; handler bodies run on spawned tasks so the
//! loop never blocks on them, which also lets handlers submit follow-up
//! events and await their replies without re-entrancy deadlock.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod capabilities;
mod discovery;
mod error;
mod log;
mod orch_index;
mod registry;
mod router;
mod subscription;
mod transformer;

pub use capabilities::CapabilityIndex;
pub use discovery::register_discovery_handlers;
pub use error::{RouterError, RouterResult};
pub use log::{EventLog, LogEntry, LogOutcome};
pub use orch_index::{OrchNode, OrchestrationIndex};
pub use registry::{
    EventHandler, HandlerApi, HandlerRegistry, HandlerSpec, ParamSpec, ParamType,
};
pub use router::{Router, RouterHandle};
pub use subscription::{
    DeliveryQueue, PushOutcome, Subscription, SubscriptionRegistry, SubscriptionScope,
};
pub use transformer::{TransformerRegistry, TransformerRule, TransformerSet};
