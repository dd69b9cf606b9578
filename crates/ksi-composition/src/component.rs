//! Resolved component values and their typed views.

use std::collections::BTreeMap;

use ksi_core::CapabilitySet;
use serde::{Deserialize, Serialize};

use crate::error::{CompositionError, CompositionResult};

// ---------------------------------------------------------------------------
// ComponentType
// ---------------------------------------------------------------------------

/// What a component declares itself to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// Concrete agent configuration (model, prompt, capabilities).
    Profile,
    /// Reusable prompt/config fragment mixed into profiles.
    Behavior,
    /// Orchestration pattern: agents to spawn and subscription levels.
    Pattern,
    /// A set of declarative router transformer rules.
    TransformerSet,
}

impl ComponentType {
    /// The frontmatter string for this type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Behavior => "behavior",
            Self::Pattern => "pattern",
            Self::TransformerSet => "transformer_set",
        }
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// A fully resolved component.
///
/// Inheritance and mixins are already folded in and every `{{var}}`
/// interpolation substituted; `body` holds the component's remaining
/// fields with sorted keys. Serializing a `Component`, re-parsing it and
/// serializing again yields identical bytes (the canonical form).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Component name (unique within the tree).
    pub name: String,
    /// Declared version string.
    pub version: String,
    /// Declared type.
    pub component_type: ComponentType,
    /// Capabilities the component grants.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// All remaining fields, key-sorted.
    #[serde(default)]
    pub body: BTreeMap<String, serde_json::Value>,
}

impl Component {
    /// Canonical serialized form used for round-trip identity.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::Invalid`] if serialization fails, which
    /// indicates a bug in resolution.
    pub fn canonical(&self) -> CompositionResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| CompositionError::Invalid {
            component: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// A string field from the body.
    #[must_use]
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(serde_json::Value::as_str)
    }

    /// Typed view of a profile component.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::Invalid`] if this is not a profile.
    pub fn as_profile(&self) -> CompositionResult<ProfileSpec> {
        if self.component_type != ComponentType::Profile {
            return Err(CompositionError::Invalid {
                component: self.name.clone(),
                message: format!("expected profile, found {}", self.component_type.as_str()),
            });
        }
        Ok(ProfileSpec {
            model: self.body_str("model").map(str::to_owned),
            prompt: self.body_str("prompt").map(str::to_owned),
            capabilities: self.capabilities.clone(),
        })
    }

    /// Typed view of a pattern component.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::Invalid`] if this is not a pattern or
    /// its `agents` list is malformed.
    pub fn as_pattern(&self) -> CompositionResult<PatternSpec> {
        if self.component_type != ComponentType::Pattern {
            return Err(CompositionError::Invalid {
                component: self.name.clone(),
                message: format!("expected pattern, found {}", self.component_type.as_str()),
            });
        }
        let agents_value = self.body.get("agents").cloned().unwrap_or_default();
        let agents: Vec<PatternAgent> =
            serde_json::from_value(agents_value).map_err(|e| CompositionError::Invalid {
                component: self.name.clone(),
                message: format!("agents: {e}"),
            })?;
        let event_level = self.subscription_level("event_subscription_level")?;
        let error_level = self.subscription_level("error_subscription_level")?;
        Ok(PatternSpec {
            agents,
            event_subscription_level: event_level,
            error_subscription_level: error_level,
        })
    }

    fn subscription_level(&self, key: &str) -> CompositionResult<SubscriptionLevel> {
        match self.body.get(key) {
            None => Ok(SubscriptionLevel::default()),
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|e| CompositionError::Invalid {
                    component: self.name.clone(),
                    message: format!("{key}: {e}"),
                })
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Typed views
// ---------------------------------------------------------------------------

/// Concrete agent configuration extracted from a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSpec {
    /// Model override, if declared.
    pub model: Option<String>,
    /// System prompt, if declared.
    pub prompt: Option<String>,
    /// Capabilities granted by the composition.
    pub capabilities: CapabilitySet,
}

/// One agent a pattern spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternAgent {
    /// Name within the pattern (used for edges and variables).
    pub name: String,
    /// Profile component to spawn the agent from.
    pub profile: String,
    /// Extra capability grants on top of the profile.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// First message delivered to the agent after spawn.
    #[serde(default)]
    pub initial_prompt: Option<String>,
}

/// How many levels of subtree events an orchestration hears.
///
/// `0` = only its own events, `N` = events up to `N` levels below,
/// `-1` = everything in the subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionLevel(pub i32);

impl SubscriptionLevel {
    /// Listen to the whole subtree.
    #[must_use]
    pub fn all() -> Self {
        Self(-1)
    }

    /// Whether an event `relative_depth` levels below is within this level.
    #[must_use]
    pub fn covers(self, relative_depth: u32) -> bool {
        self.0 < 0 || relative_depth <= self.0.unsigned_abs()
    }
}

impl Default for SubscriptionLevel {
    fn default() -> Self {
        Self(1)
    }
}

/// Typed view of a pattern component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Agents the orchestration spawns.
    pub agents: Vec<PatternAgent>,
    /// How deep into the subtree ordinary events bubble to the orchestrator.
    pub event_subscription_level: SubscriptionLevel,
    /// How deep into the subtree error events bubble to the orchestrator.
    pub error_subscription_level: SubscriptionLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_level_covers() {
        assert!(SubscriptionLevel(0).covers(0));
        assert!(!SubscriptionLevel(0).covers(1));
        assert!(SubscriptionLevel(1).covers(1));
        assert!(!SubscriptionLevel(1).covers(2));
        assert!(SubscriptionLevel::all().covers(99));
    }

    #[test]
    fn test_canonical_is_stable() {
        let component = Component {
            name: "researcher".to_owned(),
            version: "1.0.0".to_owned(),
            component_type: ComponentType::Profile,
            capabilities: CapabilitySet::new(),
            body: [
                ("model".to_owned(), serde_json::json!("m1")),
                ("prompt".to_owned(), serde_json::json!("You research.")),
            ]
            .into_iter()
            .collect(),
        };
        let first = component.canonical().unwrap();
        let reparsed: Component = serde_json::from_str(&first).unwrap();
        assert_eq!(reparsed.canonical().unwrap(), first);
    }
}
