//! Path-safety validation shared by the codec, storage, and snapshot layers.
//!
//! Every path that ever reaches the filesystem through this crate goes
//! through [`clean_relative`] first. An empty path is tolerated (it means
//! "no file", used to let empty checksum lines parse without error); any
//! other rejection is always fatal before a single byte is written.

use std::path::{Component, Path, PathBuf};

use crate::error::{MirrorError, PathReason, Result};

/// Cleans `raw` and asserts it is relative and free of `..` components.
///
/// Returns the empty string unchanged (callers treat that as "no file").
pub fn clean_relative(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Ok(String::new());
    }
    if raw.starts_with('/') || raw.starts_with('\\') || is_windows_drive_root(raw) {
        return Err(MirrorError::path(raw, PathReason::AbsolutePath));
    }

    let mut cleaned = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => cleaned.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(MirrorError::path(raw, PathReason::DirectoryTraversal));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(MirrorError::path(raw, PathReason::AbsolutePath));
            }
        }
    }

    Ok(cleaned.join("/"))
}

fn is_windows_drive_root(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Joins `base` with a path validated by [`clean_relative`], and confirms
/// the result is still a descendant of `base` after lexical cleaning.
pub fn safe_join(base: &Path, raw: &str) -> Result<PathBuf> {
    let cleaned = clean_relative(raw)?;
    Ok(base.join(cleaned))
}

/// Validates a bare identifier (mirror id, snapshot name) against
/// `^[a-z0-9_-]+$`, the shape every such identifier is required to have
/// wherever it appears in an on-disk path component.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(MirrorError::Config(format!(
            "{name:?} must match ^[a-z0-9_-]+$"
        )));
    }
    Ok(())
}

/// Confirms `resolved` (typically the target of a `readlink`) lies inside
/// one of `allowed_roots`. A resolved path outside all of them is always
/// a fatal, non-recoverable error (see "Implicit symlink trust" design note).
pub fn assert_within_roots(resolved: &Path, allowed_roots: &[&Path]) -> Result<()> {
    for root in allowed_roots {
        if resolved.starts_with(root) {
            return Ok(());
        }
    }
    Err(MirrorError::path(resolved, PathReason::OutsideRoot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_is_tolerated() {
        assert_eq!(clean_relative("").unwrap(), "");
    }

    #[test]
    fn rejects_absolute_path() {
        assert!(clean_relative("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_windows_root() {
        assert!(clean_relative("C:\\Windows\\system.ini").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(clean_relative("../../etc/passwd").is_err());
        assert!(clean_relative("pool/../../etc/passwd").is_err());
    }

    #[test]
    fn cleans_dot_components() {
        assert_eq!(clean_relative("./pool/./a.deb").unwrap(), "pool/a.deb");
    }

    #[test]
    fn passes_through_normal_relative_path() {
        assert_eq!(
            clean_relative("dists/stable/main/binary-amd64/Packages").unwrap(),
            "dists/stable/main/binary-amd64/Packages"
        );
    }

    #[test]
    fn assert_within_roots_rejects_escape() {
        let root = Path::new("/srv/mirror");
        let resolved = Path::new("/etc/passwd");
        assert!(assert_within_roots(resolved, &[root]).is_err());
    }

    #[test]
    fn assert_within_roots_accepts_descendant() {
        let root = Path::new("/srv/mirror");
        let resolved = Path::new("/srv/mirror/.foo.123/foo");
        assert!(assert_within_roots(resolved, &[root]).is_ok());
    }
}
