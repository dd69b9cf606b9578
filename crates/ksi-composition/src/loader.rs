//! Content tree scanning and component resolution.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use ksi_core::CapabilitySet;
use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::component::{Component, ComponentType};
use crate::error::{CompositionError, CompositionResult};
use crate::frontmatter::{RawComponent, parse_file};

/// Loads, resolves and caches components from a content tree.
///
/// Thread-safe behind interior locks; cheap to share in an `Arc`. Content
/// is read once at construction (and again on [`ComponentLoader::reload`])
/// and treated as immutable in between.
pub struct ComponentLoader {
    root: PathBuf,
    raw: RwLock<HashMap<String, RawComponent>>,
    cache: RwLock<HashMap<(String, String), Arc<Component>>>,
}

impl std::fmt::Debug for ComponentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentLoader")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ComponentLoader {
    /// Scan the content tree under `root`.
    ///
    /// Files that fail to parse are skipped with a warning so one bad file
    /// cannot take the whole library offline; a missing root yields an
    /// empty loader.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::Read`] only for I/O failures on files
    /// that exist.
    pub fn load(root: &Path) -> CompositionResult<Self> {
        let loader = Self {
            root: root.to_path_buf(),
            raw: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        };
        loader.reload()?;
        Ok(loader)
    }

    /// Re-scan the content tree and drop the resolution cache.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::Read`] for I/O failures on existing
    /// files.
    pub fn reload(&self) -> CompositionResult<()> {
        let mut scanned: HashMap<String, RawComponent> = HashMap::new();
        if self.root.is_dir() {
            for entry in WalkDir::new(&self.root).into_iter().filter_map(Result::ok) {
                let path = entry.path();
                let is_content = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| matches!(e, "yaml" | "yml" | "md"));
                if !entry.file_type().is_file() || !is_content {
                    continue;
                }
                let display_path = path.display().to_string();
                let content =
                    std::fs::read_to_string(path).map_err(|source| CompositionError::Read {
                        path: display_path.clone(),
                        source,
                    })?;
                match parse_file(&display_path, &content) {
                    Ok(raw) => {
                        if scanned.contains_key(&raw.name) {
                            warn!(name = %raw.name, path = %display_path, "duplicate component name; keeping first");
                        } else {
                            scanned.insert(raw.name.clone(), raw);
                        }
                    },
                    Err(e) => {
                        warn!(path = %display_path, error = %e, "skipping malformed component file");
                    },
                }
            }
        }
        debug!(count = scanned.len(), root = %self.root.display(), "composition tree scanned");
        *self.raw.write().expect("loader lock poisoned") = scanned;
        self.cache.write().expect("loader lock poisoned").clear();
        Ok(())
    }

    /// All known component names with their versions and types.
    #[must_use]
    pub fn list(&self) -> Vec<(String, String, ComponentType)> {
        let raw = self.raw.read().expect("loader lock poisoned");
        let mut names: Vec<_> = raw
            .values()
            .map(|r| (r.name.clone(), r.version.clone(), r.component_type))
            .collect();
        names.sort();
        names
    }

    /// Resolve a component with no variable overrides, via the cache.
    ///
    /// # Errors
    ///
    /// See [`ComponentLoader::resolve_with_vars`].
    pub fn resolve(&self, name: &str) -> CompositionResult<Arc<Component>> {
        let version = {
            let raw = self.raw.read().expect("loader lock poisoned");
            raw.get(name)
                .ok_or_else(|| CompositionError::Unknown(name.to_owned()))?
                .version
                .clone()
        };
        let key = (name.to_owned(), version);
        if let Some(hit) = self.cache.read().expect("loader lock poisoned").get(&key) {
            return Ok(Arc::clone(hit));
        }
        let component = Arc::new(self.resolve_with_vars(name, &BTreeMap::new())?);
        self.cache
            .write()
            .expect("loader lock poisoned")
            .insert(key, Arc::clone(&component));
        Ok(component)
    }

    /// Resolve a component with caller-supplied variable overrides.
    ///
    /// Resolution folds the `extends` chain, then mixins in declaration
    /// order, then the component's own fields; capability sets union
    /// across the chain. `{{var}}` interpolations draw from the merged
    /// `vars` maps plus `overrides` — anything else is an error.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::Unknown`] for missing components,
    /// [`CompositionError::Cycle`] for inheritance cycles,
    /// [`CompositionError::UndefinedVariable`] for out-of-set
    /// interpolations and [`CompositionError::Invalid`] for type-schema
    /// violations.
    pub fn resolve_with_vars(
        &self,
        name: &str,
        overrides: &BTreeMap<String, serde_json::Value>,
    ) -> CompositionResult<Component> {
        let raw = self.raw.read().expect("loader lock poisoned");
        let mut stack = HashSet::new();
        let folded = fold(&raw, name, &mut stack)?;

        let mut vars = folded.vars.clone();
        for (k, v) in overrides {
            vars.insert(k.clone(), v.clone());
        }

        let mut body = BTreeMap::new();
        for (key, value) in &folded.fields {
            body.insert(key.clone(), substitute(value, &vars, name)?);
        }

        let component = Component {
            name: folded.name.clone(),
            version: folded.version.clone(),
            component_type: folded.component_type,
            capabilities: folded.capabilities.clone(),
            body,
        };
        validate(&component)?;
        Ok(component)
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Fold the `extends` chain and mixins of `name` into one raw component.
fn fold(
    raw: &HashMap<String, RawComponent>,
    name: &str,
    stack: &mut HashSet<String>,
) -> CompositionResult<RawComponent> {
    if !stack.insert(name.to_owned()) {
        return Err(CompositionError::Cycle(name.to_owned()));
    }
    let own = raw
        .get(name)
        .ok_or_else(|| CompositionError::Unknown(name.to_owned()))?;

    let mut merged = match &own.extends {
        Some(base) => {
            let mut base = fold(raw, base, stack)?;
            // Identity always comes from the leaf, never the base.
            base.name = own.name.clone();
            base.version = own.version.clone();
            base.component_type = own.component_type;
            base
        },
        None => RawComponent {
            name: own.name.clone(),
            version: own.version.clone(),
            component_type: own.component_type,
            extends: None,
            mixins: Vec::new(),
            vars: BTreeMap::new(),
            capabilities: CapabilitySet::new(),
            fields: BTreeMap::new(),
        },
    };

    for mixin in &own.mixins {
        let mixin = fold(raw, mixin, stack)?;
        merge_into(&mut merged, &mixin);
    }
    merge_into(&mut merged, own);
    stack.remove(name);
    Ok(merged)
}

/// Merge `overlay`'s vars, capabilities and fields into `base`.
fn merge_into(base: &mut RawComponent, overlay: &RawComponent) {
    for (k, v) in &overlay.vars {
        base.vars.insert(k.clone(), v.clone());
    }
    base.capabilities = base.capabilities.union(&overlay.capabilities);
    for (k, v) in &overlay.fields {
        match (base.fields.get_mut(k), v) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
                for (ik, iv) in incoming {
                    existing.insert(ik.clone(), iv.clone());
                }
            },
            _ => {
                base.fields.insert(k.clone(), v.clone());
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Variable substitution
// ---------------------------------------------------------------------------

fn interpolation_re() -> Regex {
    // Compile failure is impossible for a fixed pattern.
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap()
}

/// Substitute `{{var}}` in every string of `value`.
///
/// A string that is exactly one interpolation splices the variable's typed
/// value; otherwise variables render through their string form.
fn substitute(
    value: &serde_json::Value,
    vars: &BTreeMap<String, serde_json::Value>,
    component: &str,
) -> CompositionResult<serde_json::Value> {
    let re = interpolation_re();
    match value {
        serde_json::Value::String(s) => {
            if let Some(captures) = re.captures(s) {
                let whole = captures.get(0).map_or("", |m| m.as_str());
                if whole == s.trim() {
                    let name = captures.get(1).map_or("", |m| m.as_str());
                    return vars.get(name).cloned().ok_or_else(|| {
                        CompositionError::UndefinedVariable {
                            name: name.to_owned(),
                            component: component.to_owned(),
                        }
                    });
                }
            }
            let mut missing = None;
            let replaced = re.replace_all(s, |caps: &regex::Captures<'_>| {
                let name = caps.get(1).map_or("", |m| m.as_str());
                match vars.get(name) {
                    Some(serde_json::Value::String(v)) => v.clone(),
                    Some(other) => other.to_string(),
                    None => {
                        missing.get_or_insert_with(|| name.to_owned());
                        String::new()
                    },
                }
            });
            if let Some(name) = missing {
                return Err(CompositionError::UndefinedVariable {
                    name,
                    component: component.to_owned(),
                });
            }
            Ok(serde_json::Value::String(replaced.into_owned()))
        },
        serde_json::Value::Array(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|v| substitute(v, vars, component))
                .collect::<CompositionResult<_>>()?,
        )),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, vars, component)?);
            }
            Ok(serde_json::Value::Object(out))
        },
        other => Ok(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(component: &Component) -> CompositionResult<()> {
    match component.component_type {
        ComponentType::Profile => {
            if component.body_str("model").is_none() && component.body_str("prompt").is_none() {
                return Err(CompositionError::Invalid {
                    component: component.name.clone(),
                    message: "profile must declare model or prompt".to_owned(),
                });
            }
        },
        ComponentType::Behavior => {},
        ComponentType::Pattern => {
            let spec = component.as_pattern()?;
            if spec.agents.is_empty() {
                return Err(CompositionError::Invalid {
                    component: component.name.clone(),
                    message: "pattern must declare at least one agent".to_owned(),
                });
            }
        },
        ComponentType::TransformerSet => {
            let Some(serde_json::Value::Array(rules)) = component.body.get("transformers") else {
                return Err(CompositionError::Invalid {
                    component: component.name.clone(),
                    message: "transformer_set must declare a transformers list".to_owned(),
                });
            };
            for rule in rules {
                let ok = rule.get("source").and_then(serde_json::Value::as_str).is_some()
                    && rule.get("target").and_then(serde_json::Value::as_str).is_some();
                if !ok {
                    return Err(CompositionError::Invalid {
                        component: component.name.clone(),
                        message: "every transformer needs string source and target".to_owned(),
                    });
                }
            }
        },
    }
    Ok(())
}
