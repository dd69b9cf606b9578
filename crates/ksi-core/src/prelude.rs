//! Convenience re-exports for downstream crates.

pub use crate::capability::{Capability, CapabilitySet};
pub use crate::error::{ErrorKind, KsiError, KsiResult};
pub use crate::event::{Event, EventContext, EventName, EventOrigin};
pub use crate::id::{
    AgentId, ClientId, CorrelationId, EventId, OrchestrationId, RequestId, SandboxId, SessionId,
    SubscriberId,
};
