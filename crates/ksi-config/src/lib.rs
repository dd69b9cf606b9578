//! KSI Config - daemon configuration.
//!
//! A single TOML file drives the daemon. Every section has production
//! defaults so a bare `[section]` header (or no file at all) yields a
//! working configuration; `validate()` runs after deserialization. All
//! filesystem paths the daemon touches are derived from here — the core
//! never hard-codes a path.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod loader;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use loader::load;
pub use types::{
    AgentsSection, CompletionSection, CompositionSection, DaemonConfig, LogSection,
    LoggingSection, ProviderSection, RetrySection, SessionSection, StoreSection, TransportSection,
};
