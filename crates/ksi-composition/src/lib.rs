//! KSI Composition - the declarative component loader.
//!
//! Pure library: no store, no router, no I/O beyond reading the content
//! tree it is pointed at. A content tree holds YAML files and markdown
//! files with YAML frontmatter; each declares `name`, `version` and
//! `component_type` (profile, behavior, pattern, transformer set) plus
//! optional `extends`, `mixins`, `vars` and `capabilities`.
//!
//! Loading resolves inheritance and mixins (cycles rejected), substitutes
//! `{{var}}` interpolations from a closed set, validates against the
//! component type's schema, and yields a canonical [`Component`] cached by
//! `(name, version)`. Content is immutable at runtime; reload is explicit.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod component;
mod error;
mod frontmatter;
mod loader;

pub use component::{
    Component, ComponentType, PatternAgent, PatternSpec, ProfileSpec, SubscriptionLevel,
};
pub use error::{CompositionError, CompositionResult};
pub use loader::ComponentLoader;
