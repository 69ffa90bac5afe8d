//! Snapshot manager (C8): hard-linked point-in-time copies of a mirror
//! tree, plus the atomic symlink bookkeeping that publishes, stages,
//! promotes, and prunes them.
//!
//! Grounded on the same atomic tempfile-then-rename discipline as
//! `storage.rs::save` (`NamedTempFile`/rename/fsync), generalized here
//! to symlinks since the teacher never needed to swing a live symlink
//! itself (it published through PostgreSQL, not the filesystem).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info};
use walkdir::WalkDir;

use crate::error::{MirrorError, Result};
use crate::path_safety::{assert_within_roots, validate_identifier as validate_component};
use crate::storage::fsync_dir;

/// Parses the Go-style `Xh`/`Xm`/`Xs` duration grammar plus the `Xd`
/// (24h) and `Xw` (7d) extensions from spec.md §4.7.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.len() < 2 {
        return Err(MirrorError::Config(format!("invalid duration {s:?}")));
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    let n: u64 = digits
        .parse()
        .map_err(|_| MirrorError::Config(format!("invalid duration {s:?}")))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        "w" => n * 604800,
        other => {
            return Err(MirrorError::Config(format!(
                "invalid duration unit {other:?} in {s:?}"
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

/// Manages `<snapDir>/<mirror>/<name>` snapshot trees and the live /
/// staging symlinks at `rootDir/<mirror>` and `rootDir/<mirror>-staging`.
pub struct SnapshotManager {
    root_dir: PathBuf,
    snap_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(root_dir: impl Into<PathBuf>, snap_dir: impl Into<PathBuf>) -> Self {
        SnapshotManager {
            root_dir: root_dir.into(),
            snap_dir: snap_dir.into(),
        }
    }

    fn mirror_dir(&self, mirror: &str) -> PathBuf {
        self.snap_dir.join(mirror)
    }

    fn snapshot_path(&self, mirror: &str, name: &str) -> Result<PathBuf> {
        validate_component(mirror)?;
        validate_component(name)?;
        Ok(self.mirror_dir(mirror).join(name))
    }

    fn live_link(&self, mirror: &str) -> PathBuf {
        self.root_dir.join(mirror)
    }

    fn staging_link(&self, mirror: &str) -> PathBuf {
        self.root_dir.join(format!("{mirror}-staging"))
    }

    /// Walks the live tree at `rootDir/mirror` (resolving the symlink
    /// first) and hard-links every regular file into a fresh snapshot
    /// directory, creating directories as needed. Non-regular files are
    /// skipped. Returns the resolved snapshot name.
    pub fn create_snapshot(
        &self,
        mirror: &str,
        name: Option<&str>,
        force: bool,
        name_format: &str,
    ) -> Result<String> {
        validate_component(mirror)?;
        let name = match name {
            Some(n) => n.to_string(),
            None => format_snapshot_name(name_format),
        };
        let dest = self.snapshot_path(mirror, &name)?;

        if dest.exists() {
            if !force {
                return Err(MirrorError::Config(format!(
                    "snapshot {mirror}/{name} already exists"
                )));
            }
            fs::remove_dir_all(&dest)?;
        }

        let live = self.live_link(mirror);
        let resolved_live = fs::canonicalize(&live)?;
        assert_within_roots(&resolved_live, &[&self.root_dir])?;

        fs::create_dir_all(&dest)?;
        for entry in WalkDir::new(&resolved_live) {
            let entry = entry.map_err(|e| {
                MirrorError::StorageCorrupt(format!("walking live tree: {e}"))
            })?;
            let rel = entry
                .path()
                .strip_prefix(&resolved_live)
                .expect("walkdir entries are descendants of the root it was given");
            if rel.as_os_str().is_empty() {
                continue;
            }
            let target = dest.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target)?;
            } else if file_type.is_file() {
                fs::hard_link(entry.path(), &target)?;
            } else {
                debug!("create_snapshot: skipping non-regular file {}", entry.path().display());
            }
        }
        fsync_dir(&dest)?;
        info!("created snapshot {mirror}/{name}");
        Ok(name)
    }

    /// Atomically swings `rootDir/mirror` to point at `<snapDir>/mirror/name`.
    pub fn publish_snapshot(&self, mirror: &str, name: &str) -> Result<()> {
        let target = self.snapshot_path(mirror, name)?;
        if !target.is_dir() {
            return Err(MirrorError::Config(format!(
                "snapshot {mirror}/{name} does not exist"
            )));
        }
        self.swing_symlink(&self.live_link(mirror), &target)
    }

    /// As [`Self::publish_snapshot`], but for the `<mirror>-staging` link.
    pub fn publish_snapshot_to_staging(&self, mirror: &str, name: &str) -> Result<()> {
        let target = self.snapshot_path(mirror, name)?;
        if !target.is_dir() {
            return Err(MirrorError::Config(format!(
                "snapshot {mirror}/{name} does not exist"
            )));
        }
        self.swing_symlink(&self.staging_link(mirror), &target)
    }

    /// Reads the target of the staging symlink and atomically swings the
    /// live symlink to the same target.
    pub fn promote_snapshot(&self, mirror: &str) -> Result<()> {
        validate_component(mirror)?;
        let staging = self.staging_link(mirror);
        let target = fs::read_link(&staging)
            .map_err(|_| MirrorError::Config(format!("no staged snapshot for mirror {mirror}")))?;
        if !target.is_dir() {
            return Err(MirrorError::Config(format!(
                "staged snapshot target for mirror {mirror} is missing"
            )));
        }
        assert_within_roots(&target, &[&self.snap_dir])?;
        self.swing_symlink(&self.live_link(mirror), &target)
    }

    fn is_linked_to(&self, link: &Path, target: &Path) -> bool {
        fs::read_link(link).map(|t| t == target).unwrap_or(false)
    }

    /// Forbids deletion if `name` is currently published or staged unless
    /// `force`, in which case the referencing symlink is unlinked first.
    pub fn delete_snapshot(&self, mirror: &str, name: &str, force: bool) -> Result<()> {
        let dest = self.snapshot_path(mirror, name)?;
        let live = self.live_link(mirror);
        let staging = self.staging_link(mirror);
        let published = self.is_linked_to(&live, &dest);
        let staged = self.is_linked_to(&staging, &dest);

        if (published || staged) && !force {
            return Err(MirrorError::Config(format!(
                "snapshot {mirror}/{name} is currently {}; use force to delete anyway",
                if published { "published" } else { "staged" }
            )));
        }
        if force {
            if published {
                fs::remove_file(&live)?;
            }
            if staged {
                fs::remove_file(&staging)?;
            }
        }
        fs::remove_dir_all(&dest)?;
        info!("deleted snapshot {mirror}/{name}");
        Ok(())
    }

    /// Lists snapshots under `<snapDir>/mirror` sorted oldest-first by
    /// mtime, excluding whichever are currently published or staged, and
    /// deletes (or merely reports, if `dry_run`) those beyond `keep_last`
    /// or older than `now - keep_within`.
    pub fn prune_snapshots(
        &self,
        mirror: &str,
        keep_last: Option<usize>,
        keep_within: Option<&str>,
        dry_run: bool,
        now: SystemTime,
    ) -> Result<Vec<String>> {
        validate_component(mirror)?;
        let dir = self.mirror_dir(mirror);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let live_target = fs::read_link(self.live_link(mirror)).ok();
        let staging_target = fs::read_link(self.staging_link(mirror)).ok();

        let mut candidates: Vec<(String, SystemTime)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if Some(&path) == live_target.as_ref() || Some(&path) == staging_target.as_ref() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let mtime = entry.metadata()?.modified()?;
            candidates.push((name, mtime));
        }
        candidates.sort_by_key(|(_, mtime)| *mtime);

        let mut to_prune: Vec<String> = Vec::new();
        if let Some(keep) = keep_last {
            if candidates.len() > keep {
                let drop_count = candidates.len() - keep;
                to_prune.extend(candidates[..drop_count].iter().map(|(n, _)| n.clone()));
            }
        }
        if let Some(within) = keep_within {
            let duration = parse_duration(within)?;
            let cutoff = now.checked_sub(duration).unwrap_or(SystemTime::UNIX_EPOCH);
            for (name, mtime) in &candidates {
                if *mtime < cutoff && !to_prune.contains(name) {
                    to_prune.push(name.clone());
                }
            }
        }

        if dry_run {
            for name in &to_prune {
                debug!("prune_snapshots: would remove {mirror}/{name}");
            }
        } else {
            for name in &to_prune {
                fs::remove_dir_all(dir.join(name))?;
                info!("pruned snapshot {mirror}/{name}");
            }
        }
        Ok(to_prune)
    }

    fn swing_symlink(&self, link: &Path, target: &Path) -> Result<()> {
        let resolved_target = fs::canonicalize(target)?;
        assert_within_roots(&resolved_target, &[&self.snap_dir])?;

        let parent = link.parent().ok_or_else(|| {
            MirrorError::Config(format!("symlink path {} has no parent", link.display()))
        })?;
        let tmp = parent.join(format!(
            ".{}.tmp",
            link.file_name().unwrap_or_default().to_string_lossy()
        ));
        let _ = fs::remove_file(&tmp);

        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &tmp)?;
        #[cfg(not(unix))]
        return Err(MirrorError::Config("symlink swap requires unix".into()));

        fs::rename(&tmp, link)?;
        fsync_dir(parent)?;
        Ok(())
    }
}

fn format_snapshot_name(name_format: &str) -> String {
    let now = time::OffsetDateTime::now_utc();
    match time::format_description::parse(name_format) {
        Ok(desc) => now
            .format(&desc)
            .unwrap_or_else(|_| now.unix_timestamp().to_string()),
        Err(_) => now.unix_timestamp().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_live_tree(root: &Path, mirror: &str) -> PathBuf {
        let real = root.join(format!(".{mirror}.0"));
        fs::create_dir_all(real.join("pool")).unwrap();
        fs::write(real.join("Release"), b"hello").unwrap();
        fs::write(real.join("pool/a.deb"), b"pkg").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real, root.join(mirror)).unwrap();
        real
    }

    #[test]
    fn create_snapshot_hardlinks_regular_files() {
        let root = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        make_live_tree(root.path(), "debian");
        fs::create_dir_all(snaps.path().join("debian")).unwrap();

        let mgr = SnapshotManager::new(root.path(), snaps.path());
        let name = mgr
            .create_snapshot("debian", Some("snap1"), false, "[year]")
            .unwrap();
        assert_eq!(name, "snap1");
        assert!(snaps.path().join("debian/snap1/Release").exists());
        assert!(snaps.path().join("debian/snap1/pool/a.deb").exists());
    }

    #[test]
    fn create_snapshot_without_force_rejects_existing() {
        let root = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        make_live_tree(root.path(), "debian");
        fs::create_dir_all(snaps.path().join("debian/snap1")).unwrap();

        let mgr = SnapshotManager::new(root.path(), snaps.path());
        assert!(mgr
            .create_snapshot("debian", Some("snap1"), false, "[year]")
            .is_err());
        assert!(mgr
            .create_snapshot("debian", Some("snap1"), true, "[year]")
            .is_ok());
    }

    #[test]
    fn publish_and_promote_swing_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        make_live_tree(root.path(), "debian");
        fs::create_dir_all(snaps.path().join("debian")).unwrap();

        let mgr = SnapshotManager::new(root.path(), snaps.path());
        mgr.create_snapshot("debian", Some("snap1"), false, "[year]")
            .unwrap();
        mgr.publish_snapshot_to_staging("debian", "snap1").unwrap();
        mgr.promote_snapshot("debian").unwrap();

        let live_target = fs::read_link(root.path().join("debian")).unwrap();
        assert_eq!(live_target, snaps.path().join("debian/snap1"));
    }

    #[test]
    fn delete_published_snapshot_requires_force() {
        let root = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        make_live_tree(root.path(), "debian");
        fs::create_dir_all(snaps.path().join("debian")).unwrap();

        let mgr = SnapshotManager::new(root.path(), snaps.path());
        mgr.create_snapshot("debian", Some("snap1"), false, "[year]")
            .unwrap();
        mgr.publish_snapshot("debian", "snap1").unwrap();

        assert!(mgr.delete_snapshot("debian", "snap1", false).is_err());
        assert!(mgr.delete_snapshot("debian", "snap1", true).is_ok());
    }

    #[test]
    fn prune_keeps_last_n_and_excludes_published() {
        let root = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        make_live_tree(root.path(), "debian");
        let dir = snaps.path().join("debian");
        fs::create_dir_all(&dir).unwrap();

        let mgr = SnapshotManager::new(root.path(), snaps.path());
        for n in ["a", "b", "c"] {
            mgr.create_snapshot("debian", Some(n), false, "[year]")
                .unwrap();
        }
        mgr.publish_snapshot("debian", "c").unwrap();

        let pruned = mgr
            .prune_snapshots("debian", Some(0), None, false, SystemTime::now())
            .unwrap();
        let mut pruned = pruned;
        pruned.sort();
        assert_eq!(pruned, vec!["a".to_string(), "b".to_string()]);
        assert!(!dir.join("a").exists());
        assert!(!dir.join("b").exists());
        assert!(dir.join("c").exists());
    }

    #[test]
    fn invalid_name_component_rejected() {
        let root = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        let mgr = SnapshotManager::new(root.path(), snaps.path());
        assert!(mgr.publish_snapshot("de bian", "snap1").is_err());
        assert!(mgr.publish_snapshot("debian", "../escape").is_err());
    }

    #[test]
    fn duration_grammar_parses_days_and_weeks() {
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 86400));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604800));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("bogus").is_err());
    }
}
