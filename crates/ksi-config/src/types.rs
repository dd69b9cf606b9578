//! Configuration types for the KSI daemon.
//!
//! All types here are self-contained; domain types are mirrored and
//! converted at the boundary. Every struct implements [`Default`] with
//! sensible production values so that a bare `[section]` header in TOML
//! produces a working configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level DaemonConfig
// ---------------------------------------------------------------------------

/// Root configuration for the KSI daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Durable store location.
    pub store: StoreSection,
    /// Transport socket and flow-control settings.
    pub transport: TransportSection,
    /// Event log root and retention.
    pub log: LogSection,
    /// Completion worker pool, timeouts, retry policy.
    pub completion: CompletionSection,
    /// Session lock and restart-grace settings.
    pub session: SessionSection,
    /// Agent sandbox root and spawn caps.
    pub agents: AgentsSection,
    /// Composition content tree location.
    pub composition: CompositionSection,
    /// Provider commands and the default model.
    pub provider: ProviderSection,
    /// Logging level and format.
    pub logging: LoggingSection,
}

impl DaemonConfig {
    /// Derive every path from a single root directory.
    ///
    /// Used by tests and by `ksid --root`: socket, store, event log,
    /// sandboxes and composition content all land under `root`.
    #[must_use]
    pub fn scoped_to(root: &Path) -> Self {
        let mut config = Self::default();
        config.transport.socket_path = root.join("daemon.sock");
        config.store.path = root.join("store.redb");
        config.log.root = root.join("event_log");
        config.agents.sandbox_root = root.join("sandboxes");
        config.composition.content_root = root.join("compositions");
        config
    }
}

// ---------------------------------------------------------------------------
// StoreSection
// ---------------------------------------------------------------------------

/// Durable store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Path of the embedded database file.
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/ksi/store.redb"),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportSection
// ---------------------------------------------------------------------------

/// Transport socket and flow-control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Path of the Unix stream socket clients connect to.
    pub socket_path: PathBuf,
    /// Bound on frames queued from one connection toward the router.
    /// Overruns answer the client with `capacity`.
    pub inbound_capacity: usize,
    /// Per-subscriber outbound queue watermark. Overruns drop the oldest
    /// frames and emit a `monitor:lag` event.
    pub outbound_watermark: usize,
    /// Maximum accepted frame payload in bytes.
    pub max_frame_bytes: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/ksi/daemon.sock"),
            inbound_capacity: 256,
            outbound_watermark: 1024,
            max_frame_bytes: 10 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// LogSection
// ---------------------------------------------------------------------------

/// Event log root and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Directory holding the daily NDJSON event log files.
    pub root: PathBuf,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/ksi/event_log"),
        }
    }
}

// ---------------------------------------------------------------------------
// CompletionSection
// ---------------------------------------------------------------------------

/// Completion worker pool, timeouts and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSection {
    /// Workers draining session queues.
    pub workers: usize,
    /// Global cap on concurrently running provider calls.
    pub max_concurrent: usize,
    /// Per-provider concurrency caps (provider name → cap).
    pub per_provider_max: HashMap<String, usize>,
    /// Per-model concurrency caps (model name → cap).
    pub per_model_max: HashMap<String, usize>,
    /// Timeout for one provider call, in seconds.
    pub provider_timeout_secs: u64,
    /// Retry behaviour for retryable provider errors.
    pub retry: RetrySection,
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            workers: 4,
            max_concurrent: 8,
            per_provider_max: HashMap::new(),
            per_model_max: HashMap::new(),
            provider_timeout_secs: 300,
            retry: RetrySection::default(),
        }
    }
}

/// Exponential-backoff retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Attempts before a retryable error becomes terminal.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionSection
// ---------------------------------------------------------------------------

/// Session lock and restart-grace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// How long one request may hold a session lock, in seconds.
    pub lock_timeout_secs: u64,
    /// Locks older than this at startup are released, in seconds.
    pub restart_grace_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 600,
            restart_grace_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentsSection
// ---------------------------------------------------------------------------

/// Agent sandbox root and spawn caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    /// Directory under which every agent sandbox lives.
    pub sandbox_root: PathBuf,
    /// Cap on direct children per parent agent.
    pub max_children_per_parent: usize,
    /// Cap on agents per orchestration.
    pub max_agents_per_orchestration: usize,
    /// Bound on each agent's message inbox.
    pub inbox_capacity: usize,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("/var/lib/ksi/sandboxes"),
            max_children_per_parent: 16,
            max_agents_per_orchestration: 32,
            inbox_capacity: 128,
        }
    }
}

// ---------------------------------------------------------------------------
// CompositionSection
// ---------------------------------------------------------------------------

/// Composition content tree location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionSection {
    /// Root of the YAML/markdown content tree.
    pub content_root: PathBuf,
}

impl Default for CompositionSection {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("/var/lib/ksi/compositions"),
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderSection
// ---------------------------------------------------------------------------

/// Provider commands and the default model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// Provider used when a request names none.
    pub default_provider: String,
    /// Model used when a request names none.
    pub default_model: String,
    /// Provider name → argv template for the external CLI.
    /// `{model}` in an element is replaced with the request's model.
    pub commands: HashMap<String, Vec<String>>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            default_provider: "mock".to_owned(),
            default_model: "default".to_owned(),
            commands: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging level and format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Tracing directive, e.g. `"info"` or `"ksi_router=debug,info"`.
    pub level: String,
    /// `"text"` or `"json"`.
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "text".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let config = DaemonConfig::default();
        assert!(config.completion.workers > 0);
        assert!(config.transport.inbound_capacity > 0);
        assert!(config.completion.retry.max_attempts > 0);
    }

    #[test]
    fn test_bare_sections_parse() {
        let config: DaemonConfig = toml::from_str("[completion]\n[transport]\n").unwrap();
        assert_eq!(config.completion.workers, DaemonConfig::default().completion.workers);
    }

    #[test]
    fn test_scoped_to_derives_all_paths() {
        let root = PathBuf::from("/tmp/ksi-test");
        let config = DaemonConfig::scoped_to(&root);
        assert!(config.transport.socket_path.starts_with(&root));
        assert!(config.store.path.starts_with(&root));
        assert!(config.log.root.starts_with(&root));
        assert!(config.agents.sandbox_root.starts_with(&root));
        assert!(config.composition.content_root.starts_with(&root));
    }
}
