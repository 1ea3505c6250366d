//! Working-root path resolution and containment

use crate::error::{ConfigError, Result, ToolError};
use std::path::{Component, Path, PathBuf};

/// The directory every tool path must stay inside.
///
/// Resolution joins relative paths onto the root, normalises `.` and `..`
/// lexically, then canonicalises the deepest existing ancestor so symlinks
/// are followed before the prefix check. A symlink that leads outside the
/// root is therefore denied, one that stays inside is allowed. Tools must
/// only ever touch the returned path.
#[derive(Debug, Clone)]
pub struct WorkingRoot {
    root: PathBuf,
}

impl WorkingRoot {
    /// Canonicalise `root`; it must be an existing directory
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|_| ConfigError::InvalidWorkingDir {
            path: root.display().to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(ConfigError::InvalidWorkingDir {
                path: root.display().to_string(),
            }
            .into());
        }
        Ok(Self { root: canonical })
    }

    /// The canonical root
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a user-supplied path, enforcing containment
    pub fn resolve(&self, input: &str) -> std::result::Result<PathBuf, ToolError> {
        let candidate = Path::new(input);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let normalized = normalize(&joined);
        let resolved = canonicalize_existing_prefix(&normalized).map_err(|e| {
            ToolError::ExecutionFailed {
                name: "path".to_string(),
                message: format!("failed to resolve {}: {}", input, e),
            }
        })?;

        // Component-wise, so /work does not admit /workspace
        if !resolved.starts_with(&self.root) {
            return Err(ToolError::AccessDenied {
                path: input.to_string(),
            });
        }

        Ok(resolved)
    }

    /// Path relative to the root for display, `.` for the root itself
    pub fn display_path(&self, resolved: &Path) -> String {
        match resolved.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => resolved.display().to_string(),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn canonicalize_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();

    loop {
        match std::fs::canonicalize(&existing) {
            Ok(canonical) => {
                let mut resolved = canonical;
                for part in rest.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Err(e);
                };
                rest.push(name);
                if !existing.pop() {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
