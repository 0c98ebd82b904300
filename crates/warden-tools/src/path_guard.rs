use std::path::{Component, Path, PathBuf};

use crate::executor::ToolError;

/// Resolve `user_path` inside `root` (or one of `extra_roots`).
///
/// Relative paths are joined to `root`; absolute paths must land under one of
/// the allowed roots. `.` resolves to `root` itself. When the root exists on
/// disk, symlinks are followed so a link cannot escape the workspace.
///
/// # Errors
///
/// Returns `ToolError::PathOutsideWorkspace` when the resolved path leaves every
/// allowed root.
pub fn safe_path(root: &Path, user_path: &str, extra_roots: &[PathBuf]) -> Result<PathBuf, ToolError> {
    let requested = Path::new(user_path);
    let candidate = if requested.is_absolute() {
        normalize(requested)
    } else {
        normalize(&root.join(requested))
    };

    let allowed = std::iter::once(root).chain(extra_roots.iter().map(PathBuf::as_path));
    for allowed_root in allowed {
        let allowed_root = normalize(allowed_root);
        if contains(&allowed_root, &candidate) && !escapes_via_symlink(&allowed_root, &candidate) {
            return Ok(candidate);
        }
    }

    tracing::warn!(path = %user_path, root = %root.display(), "path rejected");
    Err(ToolError::PathOutsideWorkspace {
        path: user_path.to_owned(),
    })
}

fn contains(root: &Path, candidate: &Path) -> bool {
    candidate.strip_prefix(root).is_ok_and(|rel| {
        !matches!(rel.components().next(), Some(Component::ParentDir))
    })
}

/// Lexical normalization: drops `.` and folds `..` without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn escapes_via_symlink(root: &Path, candidate: &Path) -> bool {
    let Ok(canonical_root) = root.canonicalize() else {
        return false;
    };
    !resolve_via_ancestors(candidate).starts_with(&canonical_root)
}

/// Canonicalize the deepest existing ancestor and re-append the missing tail.
fn resolve_via_ancestors(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut suffix = PathBuf::new();
    while !existing.exists() {
        let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
            break;
        };
        suffix = PathBuf::from(name).join(&suffix);
        existing = parent;
    }
    let base = existing
        .canonicalize()
        .unwrap_or_else(|_| existing.to_path_buf());
    if suffix.as_os_str().is_empty() {
        base
    } else {
        base.join(suffix)
    }
}
