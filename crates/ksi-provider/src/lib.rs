//! KSI Provider - the narrow seam between the completion pipeline and
//! external model CLIs.
//!
//! A [`ProviderDriver`] takes one request, streams progress updates, and
//! terminates with a result carrying the provider-minted session id (or an
//! error classified by retryability). The daemon never invents session
//! ids; drivers for CLIs with no native session concept simulate one by
//! echoing a prior id or minting a fresh one on first contact — that
//! simulation lives on the provider side of the seam.
//!
//! Two drivers ship here: [`CliDriver`] spawning a configured external
//! process, and [`MockDriver`] for tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cli;
mod driver;
mod mock;

pub use cli::CliDriver;
pub use driver::{ProviderDriver, ProviderError, ProviderReply, ProviderRequest, ProviderUsage};
pub use mock::{MockDriver, MockScript};
