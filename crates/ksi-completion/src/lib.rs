//! KSI Completion - the completion pipeline.
//!
//! Two tightly-coupled pieces live here:
//!
//! - the **session tracker** (the authority on session-id binding):
//!   request records, provider session adoption, per-session locks with
//!   expiry and FIFO waiters — all persisted through the store so state
//!   survives restart.
//! - the **completion service**: per-session FIFO queues drained by a
//!   worker pool, global / per-provider / per-model concurrency caps,
//!   exponential-backoff retry for retryable provider errors, cooperative
//!   cancellation, and the `completion:*` event surface.
//!
//! The invariant everything here protects: a session id is only ever
//! adopted from a provider reply, and one session never runs two
//! provider calls at once (fork prevention).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod service;
mod tracker;
mod types;

pub use service::{CompletionService, RecoveryReport};
pub use tracker::SessionTracker;
pub use types::{RequestRecord, RequestStatus, SessionLock, SessionRecord};
