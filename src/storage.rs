//! Content-addressed storage layer (C3): a directory tree rooted at
//! `dir/prefix`, plus a persistent `dir/info.json` checksum index.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use log::debug;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::error::{MirrorError, Result};
use crate::fileinfo::FileInfo;
use crate::path_safety::safe_join;

/// A content tree rooted at `dir/prefix`, with an `info.json` index
/// mapping canonical repository path (and every by-hash alias it was
/// stored under) to the [`FileInfo`] describing the linked file.
pub struct Storage {
    dir: PathBuf,
    prefix: PathBuf,
    info: RwLock<HashMap<String, FileInfo>>,
}

impl Storage {
    /// `dir` must be an absolute, pre-existing directory.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_absolute() {
            return Err(MirrorError::Config(format!(
                "storage dir must be absolute: {}",
                dir.display()
            )));
        }
        if !dir.is_dir() {
            return Err(MirrorError::Config(format!(
                "storage dir does not exist: {}",
                dir.display()
            )));
        }
        Ok(Storage {
            dir,
            prefix: prefix.into(),
            info: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root(&self) -> PathBuf {
        self.dir.join(&self.prefix)
    }

    fn info_json_path(&self) -> PathBuf {
        self.dir.join("info.json")
    }

    fn content_path(&self, repo_path: &str) -> Result<PathBuf> {
        safe_join(&self.root(), repo_path)
    }

    /// Reads `info.json` if present. Absence is not an error.
    pub fn load(&self) -> Result<()> {
        let path = self.info_json_path();
        if !path.exists() {
            return Ok(());
        }
        let bytes = fs::read(&path)?;
        let map: HashMap<String, FileInfo> = serde_json::from_slice(&bytes)
            .map_err(|e| MirrorError::StorageCorrupt(format!("info.json: {e}")))?;
        *self.info.write().unwrap() = map;
        Ok(())
    }

    /// Atomically writes `info.json` (create-and-rename), then `fsync`s
    /// the file and recursively `fsync`s every directory in the tree so
    /// the index survives a crash before the parent symlink swap.
    pub fn save(&self) -> Result<()> {
        let map = self.info.read().unwrap();
        let serialized = serde_json::to_vec_pretty(&*map)
            .map_err(|e| MirrorError::StorageCorrupt(format!("serializing info.json: {e}")))?;
        drop(map);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serialized)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.info_json_path())
            .map_err(|e| MirrorError::Io(e.error))?;

        fsync_dir(&self.dir)?;
        for entry in WalkDir::new(self.root()).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() {
                fsync_dir(entry.path())?;
            }
        }
        Ok(())
    }

    /// Creates a fresh, caller-owned temp file inside `dir` with mode 0600.
    pub fn temp_file(&self) -> Result<NamedTempFile> {
        let tmp = NamedTempFile::new_in(&self.dir)?;
        #[cfg(unix)]
        {
            let mut perms = tmp.as_file().metadata()?.permissions();
            perms.set_mode(0o600);
            tmp.as_file().set_permissions(perms)?;
        }
        Ok(tmp)
    }

    /// Hard-links `src_path` into `dir/prefix/fi.path`, creating parent
    /// directories as needed. If the target already exists it is unlinked
    /// and the link retried once (idempotent for resume). Registers `fi`
    /// at its canonical key; a duplicate canonical key with differing
    /// content is an error, an identical duplicate is a no-op.
    pub fn store_link(&self, fi: &FileInfo, src_path: &Path) -> Result<()> {
        self.check_duplicate(&fi.path, fi)?;
        let dst = self.content_path(&fi.path)?;
        link_idempotent(src_path, &dst)?;
        self.info.write().unwrap().insert(fi.path.clone(), fi.clone());
        Ok(())
    }

    /// As [`Self::store_link`], plus a hard link at each by-hash alias
    /// path whose checksum is present. An alias that already exists is
    /// left untouched (a hard link to the same inode is idempotent).
    pub fn store_link_with_hash(&self, fi: &FileInfo, src_path: &Path) -> Result<()> {
        self.check_duplicate(&fi.path, fi)?;
        let dst = self.content_path(&fi.path)?;
        link_idempotent(src_path, &dst)?;

        for (_, alias) in fi.by_hash_paths() {
            self.check_duplicate(&alias, fi)?;
            let alias_dst = self.content_path(&alias)?;
            if !alias_dst.exists() {
                link_idempotent(src_path, &alias_dst)?;
            }
            self.info.write().unwrap().insert(alias, fi.clone());
        }
        self.info.write().unwrap().insert(fi.path.clone(), fi.clone());
        Ok(())
    }

    fn check_duplicate(&self, key: &str, fi: &FileInfo) -> Result<()> {
        if let Some(existing) = self.info.read().unwrap().get(key) {
            if existing != fi {
                return Err(MirrorError::StorageCorrupt(format!(
                    "duplicate key {key} with differing content"
                )));
            }
        }
        Ok(())
    }

    /// Attempts keys in order SHA512 by-hash, SHA256 by-hash (if
    /// `byhash`), then canonical path. Returns a hit only when the
    /// stored `FileInfo` is [`FileInfo::same`] as `query` and the
    /// physical file exists.
    pub fn lookup(&self, query: &FileInfo, byhash: bool) -> Result<Option<(FileInfo, PathBuf)>> {
        let mut candidate_keys = Vec::new();
        if byhash {
            if let Some(p) = query.by_hash_path(crate::fileinfo::HashAlgo::Sha512) {
                candidate_keys.push(p);
            }
            if let Some(p) = query.by_hash_path(crate::fileinfo::HashAlgo::Sha256) {
                candidate_keys.push(p);
            }
        }
        candidate_keys.push(query.path.clone());

        let info = self.info.read().unwrap();
        for key in candidate_keys {
            let _ = crate::path_safety::clean_relative(&key)?;
            if let Some(stored) = info.get(&key) {
                if stored.same(query) {
                    let path = self.content_path(&stored.path)?;
                    if path.exists() {
                        return Ok(Some((stored.clone(), path)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Path-validated read of a stored file.
    pub fn open(&self, path: &str) -> Result<File> {
        let full = self.content_path(path)?;
        Ok(File::open(full)?)
    }
}

fn link_idempotent(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!("{} already exists, relinking", dst.display());
            fs::remove_file(dst)?;
            fs::hard_link(src, dst)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    let f = File::open(path)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn fsync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), "live").unwrap();
        (dir, storage)
    }

    fn fake_source(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("source-file");
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn store_link_then_lookup_by_canonical_path() {
        let (dir, storage) = new_storage();
        let src = fake_source(dir.path(), b"hello");
        let fi = FileInfo::new("Release", 5, true).unwrap().with_sha256([1u8; 32]);
        storage.store_link(&fi, &src).unwrap();

        let found = storage.lookup(&fi, false).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn store_link_with_hash_creates_by_hash_alias() {
        let (dir, storage) = new_storage();
        let src = fake_source(dir.path(), b"hello");
        let fi = FileInfo::new("dists/stable/main/binary-amd64/Packages", 5, true)
            .unwrap()
            .with_sha256([2u8; 32]);
        storage.store_link_with_hash(&fi, &src).unwrap();

        let by_hash = fi.by_hash_path(crate::fileinfo::HashAlgo::Sha256).unwrap();
        assert!(storage.root().join(&by_hash).exists());
        assert!(storage.root().join(&fi.path).exists());
    }

    #[test]
    fn store_link_is_idempotent_for_resume() {
        let (dir, storage) = new_storage();
        let src = fake_source(dir.path(), b"hello");
        let fi = FileInfo::new("Release", 5, true).unwrap().with_sha256([3u8; 32]);
        storage.store_link(&fi, &src).unwrap();
        storage.store_link(&fi, &src).unwrap();
    }

    #[test]
    fn duplicate_key_with_different_content_is_error() {
        let (dir, storage) = new_storage();
        let src = fake_source(dir.path(), b"hello");
        let fi1 = FileInfo::new("Release", 5, true).unwrap().with_sha256([4u8; 32]);
        let fi2 = FileInfo::new("Release", 6, true).unwrap().with_sha256([5u8; 32]);
        storage.store_link(&fi1, &src).unwrap();
        assert!(storage.store_link(&fi2, &src).is_err());
    }

    #[test]
    fn lookup_rejects_traversal_key() {
        let (_dir, storage) = new_storage();
        let bogus = FileInfo {
            path: "../escape".into(),
            size: 0,
            md5sum: None,
            sha1sum: None,
            sha256sum: Some([6u8; 32]),
            sha512sum: None,
        };
        assert!(storage.lookup(&bogus, false).is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let (dir, storage) = new_storage();
        let src = fake_source(dir.path(), b"hello");
        let fi = FileInfo::new("Release", 5, true).unwrap().with_sha256([7u8; 32]);
        storage.store_link(&fi, &src).unwrap();
        storage.save().unwrap();

        let reloaded = Storage::new(dir.path(), "live").unwrap();
        reloaded.load().unwrap();
        assert!(reloaded.lookup(&fi, false).unwrap().is_some());
    }
}
