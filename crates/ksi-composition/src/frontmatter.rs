//! Content file parsing.
//!
//! Two file shapes are accepted: plain YAML (`.yaml`/`.yml`) where the
//! whole document is the component, and markdown (`.md`) where a YAML
//! frontmatter block sits between `---` fences and the remaining text
//! becomes the component's `prompt` unless one is already declared.

use std::collections::BTreeMap;

use ksi_core::CapabilitySet;

use crate::component::ComponentType;
use crate::error::{CompositionError, CompositionResult};

/// A parsed but unresolved content file.
#[derive(Debug, Clone)]
pub(crate) struct RawComponent {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) component_type: ComponentType,
    pub(crate) extends: Option<String>,
    pub(crate) mixins: Vec<String>,
    pub(crate) vars: BTreeMap<String, serde_json::Value>,
    pub(crate) capabilities: CapabilitySet,
    pub(crate) fields: BTreeMap<String, serde_json::Value>,
}

/// Keys consumed by resolution rather than copied into the body.
const CONTROL_KEYS: [&str; 7] = [
    "name",
    "version",
    "component_type",
    "extends",
    "mixins",
    "vars",
    "capabilities",
];

/// Parse one content file.
pub(crate) fn parse_file(path: &str, content: &str) -> CompositionResult<RawComponent> {
    let (yaml, markdown_body) = if path.ends_with(".md") {
        split_frontmatter(path, content)?
    } else {
        (content.to_owned(), None)
    };

    let doc: serde_yaml::Value =
        serde_yaml::from_str(&yaml).map_err(|e| CompositionError::Malformed {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
    let serde_yaml::Value::Mapping(mapping) = doc else {
        return Err(CompositionError::Malformed {
            path: path.to_owned(),
            message: "component document must be a mapping".to_owned(),
        });
    };

    let mut fields: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for (key, value) in mapping {
        let serde_yaml::Value::String(key) = key else {
            return Err(CompositionError::Malformed {
                path: path.to_owned(),
                message: "component keys must be strings".to_owned(),
            });
        };
        let json = serde_json::to_value(value).map_err(|e| CompositionError::Malformed {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        fields.insert(key, json);
    }

    let name = take_str(&mut fields, path, "name")?;
    let version = fields
        .remove("version")
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| "0.0.0".to_owned());
    let type_str = take_str(&mut fields, path, "component_type")?;
    let component_type = match type_str.as_str() {
        "profile" => ComponentType::Profile,
        "behavior" => ComponentType::Behavior,
        "pattern" => ComponentType::Pattern,
        "transformer_set" => ComponentType::TransformerSet,
        other => {
            return Err(CompositionError::Malformed {
                path: path.to_owned(),
                message: format!("unknown component_type {other:?}"),
            });
        },
    };

    let extends = fields
        .remove("extends")
        .and_then(|v| v.as_str().map(str::to_owned));
    let mixins = match fields.remove("mixins") {
        None => Vec::new(),
        Some(value) => serde_json::from_value(value).map_err(|e| CompositionError::Malformed {
            path: path.to_owned(),
            message: format!("mixins: {e}"),
        })?,
    };
    let vars = match fields.remove("vars") {
        None => BTreeMap::new(),
        Some(value) => serde_json::from_value(value).map_err(|e| CompositionError::Malformed {
            path: path.to_owned(),
            message: format!("vars: {e}"),
        })?,
    };
    let capabilities = match fields.remove("capabilities") {
        None => CapabilitySet::new(),
        Some(value) => serde_json::from_value(value).map_err(|e| CompositionError::Malformed {
            path: path.to_owned(),
            message: format!("capabilities: {e}"),
        })?,
    };

    // Leftover control keys never reach the body.
    for key in CONTROL_KEYS {
        fields.remove(key);
    }

    if let Some(body) = markdown_body {
        let trimmed = body.trim();
        if !trimmed.is_empty() {
            fields
                .entry("prompt".to_owned())
                .or_insert_with(|| serde_json::Value::String(trimmed.to_owned()));
        }
    }

    Ok(RawComponent {
        name,
        version,
        component_type,
        extends,
        mixins,
        vars,
        capabilities,
        fields,
    })
}

fn take_str(
    fields: &mut BTreeMap<String, serde_json::Value>,
    path: &str,
    key: &str,
) -> CompositionResult<String> {
    fields
        .remove(key)
        .and_then(|v| v.as_str().map(str::to_owned))
        .ok_or_else(|| CompositionError::Malformed {
            path: path.to_owned(),
            message: format!("missing required frontmatter field {key:?}"),
        })
}

/// Split a markdown file into its frontmatter YAML and remaining text.
fn split_frontmatter(path: &str, content: &str) -> CompositionResult<(String, Option<String>)> {
    let rest = content
        .strip_prefix("---")
        .ok_or_else(|| CompositionError::Malformed {
            path: path.to_owned(),
            message: "markdown component must start with --- frontmatter".to_owned(),
        })?;
    let Some(end) = rest.find("\n---") else {
        return Err(CompositionError::Malformed {
            path: path.to_owned(),
            message: "unterminated frontmatter block".to_owned(),
        });
    };
    let yaml = rest[..end].to_owned();
    let body = rest[end + 4..].to_owned();
    Ok((yaml, Some(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_component() {
        let raw = parse_file(
            "researcher.yaml",
            "name: researcher\nversion: 1.2.0\ncomponent_type: profile\nmodel: m1\ncapabilities: [state_write]\n",
        )
        .unwrap();
        assert_eq!(raw.name, "researcher");
        assert_eq!(raw.version, "1.2.0");
        assert_eq!(raw.component_type, ComponentType::Profile);
        assert_eq!(raw.fields["model"], "m1");
        assert_eq!(raw.capabilities.len(), 1);
    }

    #[test]
    fn test_parse_markdown_body_becomes_prompt() {
        let raw = parse_file(
            "base.md",
            "---\nname: base\ncomponent_type: behavior\n---\nAlways be concise.\n",
        )
        .unwrap();
        assert_eq!(raw.fields["prompt"], "Always be concise.");
    }

    #[test]
    fn test_missing_name_rejected() {
        let err = parse_file("x.yaml", "component_type: profile\n").unwrap_err();
        assert!(matches!(err, CompositionError::Malformed { .. }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = parse_file("x.yaml", "name: x\ncomponent_type: widget\n").unwrap_err();
        assert!(matches!(err, CompositionError::Malformed { .. }));
    }
}
