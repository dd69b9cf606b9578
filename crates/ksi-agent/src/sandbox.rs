//! Sandbox directories and path confinement.
//!
//! Every agent owns a directory named by a stable uuid under the
//! configured sandbox root; the path is persisted on the agent entity
//! and survives restart. Confinement is lexical: a candidate path is
//! normalized (`.` and `..` resolved component-wise, no filesystem
//! access required) and must land inside the sandbox or one of the
//! explicitly shared subtrees, otherwise `permission_denied`.

use std::path::{Component, Path, PathBuf};

use ksi_core::{KsiError, KsiResult, SandboxId};
use tracing::debug;

/// Allocates and polices sandbox directories.
#[derive(Debug, Clone)]
pub struct SandboxManager {
    root: PathBuf,
}

impl SandboxManager {
    /// Manager rooted at `root` (from configuration).
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The sandbox directory for `id` (not yet created).
    #[must_use]
    pub fn path_for(&self, id: &SandboxId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Create the sandbox directory for `id`.
    ///
    /// # Errors
    ///
    /// Returns `io` if the directory cannot be created.
    pub fn allocate(&self, id: &SandboxId) -> KsiResult<PathBuf> {
        let path = self.path_for(id);
        std::fs::create_dir_all(&path).map_err(|e| KsiError::io(e.to_string()))?;
        debug!(sandbox = %path.display(), "sandbox allocated");
        Ok(path)
    }

    /// Remove a sandbox directory and its contents.
    ///
    /// # Errors
    ///
    /// Returns `io` on filesystem failure; a missing directory is fine.
    pub fn remove(&self, id: &SandboxId) -> KsiResult<()> {
        let path = self.path_for(id);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KsiError::io(e.to_string())),
        }
    }

    /// Resolve `candidate` against `sandbox` and confine it.
    ///
    /// Relative candidates resolve inside the sandbox; absolute ones
    /// must already point into the sandbox or one of `shared`.
    ///
    /// # Errors
    ///
    /// Returns `permission_denied` on any escape.
    pub fn confine(
        &self,
        sandbox: &Path,
        candidate: &str,
        shared: &[PathBuf],
    ) -> KsiResult<PathBuf> {
        let joined = {
            let candidate = Path::new(candidate);
            if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                sandbox.join(candidate)
            }
        };
        let normalized = normalize(&joined);
        let allowed = normalized.starts_with(sandbox)
            || shared.iter().any(|base| normalized.starts_with(base));
        if allowed {
            Ok(normalized)
        } else {
            Err(KsiError::permission_denied(format!(
                "path {} escapes the sandbox",
                normalized.display()
            )))
        }
    }
}

/// Resolve `.` and `..` lexically; `..` at the root is dropped.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                out.pop();
            },
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (SandboxManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (SandboxManager::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn test_allocate_and_remove() {
        let (manager, _dir) = manager();
        let id = SandboxId::new();
        let path = manager.allocate(&id).unwrap();
        assert!(path.is_dir());
        manager.remove(&id).unwrap();
        assert!(!path.exists());
        // Idempotent.
        manager.remove(&id).unwrap();
    }

    #[test]
    fn test_confinement_allows_inside() {
        let (manager, _dir) = manager();
        let id = SandboxId::new();
        let sandbox = manager.allocate(&id).unwrap();
        let resolved = manager.confine(&sandbox, "notes/draft.md", &[]).unwrap();
        assert!(resolved.starts_with(&sandbox));
    }

    #[test]
    fn test_confinement_rejects_escape() {
        let (manager, _dir) = manager();
        let id = SandboxId::new();
        let sandbox = manager.allocate(&id).unwrap();
        for candidate in ["../outside.txt", "a/../../outside.txt", "/etc/passwd"] {
            let err = manager.confine(&sandbox, candidate, &[]).unwrap_err();
            assert_eq!(err.kind, ksi_core::ErrorKind::PermissionDenied, "{candidate}");
        }
    }

    #[test]
    fn test_shared_subtree_is_reachable() {
        let (manager, dir) = manager();
        let id = SandboxId::new();
        let sandbox = manager.allocate(&id).unwrap();
        let shared = dir.path().join("shared");
        let resolved = manager
            .confine(&sandbox, shared.join("common.txt").to_str().unwrap(), &[shared.clone()])
            .unwrap();
        assert!(resolved.starts_with(&shared));
    }
}
