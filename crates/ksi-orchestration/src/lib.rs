//! KSI Orchestration - trees of agents with per-level event bubbling.
//!
//! An orchestration owns a subtree of agents and child orchestrations,
//! started from a declarative pattern. Events from the subtree bubble to
//! the orchestrator within the pattern's `event_subscription_level`
//! (errors have their own level), and termination cascades post-order so
//! no descendant outlives its tree.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod service;

pub use service::OrchestrationService;
