//! KSI Store - the durable store every other subsystem persists through.
//!
//! Three orthogonal surfaces over a single embedded transactional engine
//! (redb):
//!
//! - **KV**: `get` / `set` / `delete` / `list` (glob, paged) /
//!   `compare_and_set`
//! - **Queue**: FIFO `push` / `pop` / `length` plus an async
//!   [`Store::pop_wait`] that wakes on push
//! - **Graph**: typed entities with property bags, directed typed
//!   relationships, bounded `neighbors` and BFS `traverse`
//!
//! Every mutation is one transaction; readers see a consistent snapshot.
//! `list`, `neighbors` and `traverse` bound their work and hand back a
//! continuation token when truncated.
//!
//! Point operations are fast in-process reads/writes; they are called
//! directly from async contexts without a blocking-pool hop.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod graph;
mod index;
mod store;
mod types;

pub use error::{StoreError, StoreResult};
pub use index::{IndexKind, LogPointer};
pub use store::Store;
pub use types::{
    Direction, EntityRecord, EntityRef, KvPage, NeighborPage, RelRecord, TraversePage, UpdateMode,
};
