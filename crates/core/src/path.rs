//! Path sanitization and separator translation for port boundaries.

use std::path::{Component, Path, PathBuf};

use crate::error::DzipError;
use crate::Result;

/// Normalizes an archive-internal path (which may use `/` or `\` separators)
/// to a logical, forward-slash, relative path, rejecting `..`,
/// absolute anchors, drive letters, and embedded NUL bytes.
pub fn sanitize_logical_path(raw: &str) -> Result<String> {
    if raw.contains('\0') {
        return Err(DzipError::PathTraversal {
            path: raw.to_string(),
        });
    }

    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(DzipError::PathTraversal {
            path: raw.to_string(),
        });
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(DzipError::PathTraversal {
                    path: raw.to_string(),
                });
            }
            p if p.contains(':') => {
                return Err(DzipError::PathTraversal {
                    path: raw.to_string(),
                });
            }
            p => parts.push(p),
        }
    }

    if parts.is_empty() {
        return Err(DzipError::PathTraversal {
            path: raw.to_string(),
        });
    }

    Ok(parts.join("/"))
}

/// Translates a sanitized logical (`/`-separated) path to a host-native
/// relative `PathBuf`. Also defends in depth against traversal: any
/// `ParentDir`/`Prefix`/`RootDir` component surviving sanitization is
/// rejected rather than silently skipped.
pub fn to_native(logical: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(logical).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DzipError::PathTraversal {
                    path: logical.to_string(),
                });
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(DzipError::PathTraversal {
            path: logical.to_string(),
        });
    }
    Ok(out)
}

/// Joins a logical directory and filename the way the mapping table stores
/// them, producing a single sanitizable logical path string.
pub fn join_logical(directory: &str, filename: &str) -> String {
    if directory.is_empty() {
        filename.to_string()
    } else {
        format!("{}/{}", directory.trim_end_matches(['/', '\\']), filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_mixed_separators() {
        let p = sanitize_logical_path("textures\\ui/icons").unwrap();
        assert_eq!(p, "textures/ui/icons");
    }

    #[test]
    fn rejects_parent_dir() {
        assert!(sanitize_logical_path("../etc/passwd").is_err());
        assert!(sanitize_logical_path("images/../../secret.txt").is_err());
    }

    #[test]
    fn rejects_absolute_and_drive_letters() {
        assert!(sanitize_logical_path("/etc/passwd").is_err());
        assert!(sanitize_logical_path("C:\\Windows\\System32").is_err());
    }

    #[test]
    fn rejects_embedded_nul() {
        assert!(sanitize_logical_path("foo\0bar").is_err());
    }

    #[test]
    fn rejects_empty_after_sanitization() {
        assert!(sanitize_logical_path(".").is_err());
        assert!(sanitize_logical_path("").is_err());
    }

    #[test]
    fn to_native_builds_relative_path() {
        let native = to_native("folder/subfolder/file.txt").unwrap();
        let expected: PathBuf = ["folder", "subfolder", "file.txt"].iter().collect();
        assert_eq!(native, expected);
    }

    #[test]
    fn join_logical_handles_empty_directory() {
        assert_eq!(join_logical("", "a.png"), "a.png");
        assert_eq!(join_logical("tex", "a.png"), "tex/a.png");
    }
}
