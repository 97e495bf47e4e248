//! Lexical path confinement against the sandbox root.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::{Result, SandboxError};

/// Maximum accepted length for a requested path, in bytes.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Resolves user-supplied paths against the sandbox root and rejects
/// anything that would land outside it.
///
/// Confinement is purely lexical: `.` and `..` segments are collapsed
/// without touching the filesystem, and absolute input is re-rooted under
/// the sandbox. Symbolic links are NOT resolved, so a symlink inside the
/// sandbox pointing outside it is not caught here — a known limitation of
/// this scheme.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a raw path to an absolute path inside the sandbox.
    ///
    /// Every filesystem and command operation goes through here before
    /// touching the OS; results are never cached across requests.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SandboxError::InvalidPath);
        }
        if raw.len() > MAX_PATH_LENGTH {
            return Err(SandboxError::PathTooLong {
                max: MAX_PATH_LENGTH,
            });
        }

        let cleaned = normalize(Path::new(raw));
        // A `..` that survives normalization climbs above the join point.
        if cleaned.components().any(|c| c == Component::ParentDir) {
            warn!(requested = raw, "path traversal attempt rejected");
            return Err(SandboxError::SandboxViolation {
                path: raw.to_string(),
            });
        }

        // Re-root absolute input: "/etc/passwd" resolves to <root>/etc/passwd.
        let relative: PathBuf = cleaned
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();

        let joined = normalize(&self.root.join(relative));
        if !joined.starts_with(&self.root) {
            warn!(
                requested = raw,
                root = %self.root.display(),
                "sandbox violation rejected"
            );
            return Err(SandboxError::SandboxViolation {
                path: raw.to_string(),
            });
        }
        Ok(joined)
    }

    /// Express an in-sandbox absolute path relative to the root, `"."` for
    /// the root itself.
    pub fn relative(&self, abs: &Path) -> PathBuf {
        match abs.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
            Ok(rel) => rel.to_path_buf(),
            Err(_) => abs.to_path_buf(),
        }
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
/// Leading `..` segments that cannot be collapsed are kept, so callers can
/// detect paths that climb above their starting point.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                Some(Component::ParentDir) | None => parts.push(component),
                Some(_) => {
                    parts.pop();
                }
            },
            _ => parts.push(component),
        }
    }

    let mut result = PathBuf::new();
    for part in &parts {
        result.push(part.as_os_str());
    }
    if result.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        result
    }
}
