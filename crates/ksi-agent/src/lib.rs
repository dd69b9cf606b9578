//! KSI Agent - agent lifecycle, sandboxes and message delivery.
//!
//! Agents are event-emitting entities with a state machine
//! (`spawning → ready → running/idle → terminating → terminated`), a
//! sandbox directory that persists across turns, a capability set
//! resolved from their composition plus parental grants, and a FIFO
//! inbox drained by one worker task per live agent.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod sandbox;
mod service;
mod state;

pub use sandbox::SandboxManager;
pub use service::AgentService;
pub use state::AgentState;
