//! Mirror controller (C6): owns one mirror's current/new [`Storage`]
//! generations, its [`Fetcher`], and the atomic symlink swap that
//! publishes a finished update.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::config::{MirrorConfig, TlsConfig};
use crate::error::{MirrorError, Result};
use crate::fetcher::Fetcher;
use crate::fileinfo::FileInfo;
use crate::filter::FilterConfig;
use crate::path_safety::{assert_within_roots, validate_identifier};
use crate::pgp::Verifier;
use crate::pipeline::{self, UsageStats};
use crate::storage::{fsync_dir, Storage};

/// One configured mirror, bound to a specific run timestamp.
pub struct Mirror {
    id: String,
    config: MirrorConfig,
    root_dir: PathBuf,
    gen_dir: PathBuf,
    current: Option<Arc<Storage>>,
    new_storage: Arc<Storage>,
    fetcher: Arc<Fetcher>,
    verifier: Option<Verifier>,
    dry_run: bool,
}

impl Mirror {
    /// `timestamp` names this run's generation directory,
    /// `rootDir/.{id}.{timestamp}`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root_dir: &Path,
        id: &str,
        config: &MirrorConfig,
        global_tls: Option<&TlsConfig>,
        max_conns: usize,
        parent_cancel: &CancellationToken,
        no_pgp_check: bool,
        dry_run: bool,
        timestamp: &str,
    ) -> Result<Self> {
        validate_identifier(id)?;
        config
            .validate(id)
            .map_err(|e| MirrorError::Config(e.to_string()))?;

        let current = match Self::open_current(root_dir, id)? {
            Some(storage) => {
                storage.load()?;
                Some(Arc::new(storage))
            }
            None => None,
        };

        let gen_dir = root_dir.join(format!(".{id}.{timestamp}"));
        fs::create_dir_all(&gen_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&gen_dir)?.permissions();
            perms.set_mode(0o750);
            fs::set_permissions(&gen_dir, perms)?;
        }
        let new_storage = Arc::new(Storage::new(&gen_dir, id)?);
        fs::create_dir_all(new_storage.root())?;

        let effective_no_pgp = no_pgp_check || config.no_pgp_check;
        let verifier = if effective_no_pgp {
            None
        } else {
            let key_path = config.pgp_key_path.as_deref().ok_or_else(|| {
                MirrorError::Pgp(format!("mirror {id}: no pgp_key_path configured"))
            })?;
            Some(Verifier::load(Path::new(key_path))?)
        };

        let effective_tls = config.tls.as_ref().or(global_tls);
        let cancel = parent_cancel.child_token();
        let fetcher = Arc::new(
            Fetcher::new(max_conns, cancel, effective_tls)
                .map_err(|e| MirrorError::Config(e.to_string()))?,
        );

        Ok(Mirror {
            id: id.to_string(),
            config: config.clone(),
            root_dir: root_dir.to_path_buf(),
            gen_dir,
            current,
            new_storage,
            fetcher,
            verifier,
            dry_run,
        })
    }

    /// Resolves `rootDir/id` (if present) to its underlying generation's
    /// content directory and builds a [`Storage`] over it, validating
    /// the resolved path stays within `rootDir`.
    fn open_current(root_dir: &Path, id: &str) -> Result<Option<Storage>> {
        let link = root_dir.join(id);
        if !link.exists() {
            return Ok(None);
        }
        let resolved = fs::canonicalize(&link)?;
        assert_within_roots(&resolved, &[root_dir])?;
        let storage_dir = resolved.parent().ok_or_else(|| {
            MirrorError::StorageCorrupt(format!(
                "resolved mirror path {} has no parent",
                resolved.display()
            ))
        })?;
        Ok(Some(Storage::new(storage_dir, id)?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.fetcher.cancellation()
    }

    /// Runs every configured suite's pipeline in turn, merges the
    /// resulting package sets, and (unless dry-run) saves the new
    /// storage generation and atomically swings the live symlink.
    pub async fn update(&self) -> Result<UsageStats> {
        let base_url: Url = self
            .config
            .normalized_url()
            .parse()
            .map_err(|e| MirrorError::Config(format!("invalid mirror url: {e}")))?;

        let filter_cfg = FilterConfig {
            exclude_patterns: &self.config.filters.exclude_patterns,
            keep_versions: self.config.filters.keep_versions,
        };

        let mut merged: HashMap<String, FileInfo> = HashMap::new();
        let mut usage = UsageStats::default();

        for suite in &self.config.suites {
            info!("{}: updating suite {suite}", self.id);
            let result = pipeline::run_suite(
                self.fetcher.clone(),
                self.current.clone(),
                self.new_storage.clone(),
                &base_url,
                suite,
                self.verifier.as_ref(),
                &self.config.sections,
                &self.config.architectures,
                self.config.mirror_source,
                &filter_cfg,
                self.dry_run,
            )
            .await?;

            usage.release_bytes += result.usage.release_bytes;
            usage.index_bytes += result.usage.index_bytes;
            usage.package_bytes += result.usage.package_bytes;

            for (path, fi) in result.packages {
                match merged.get(&path) {
                    Some(existing) if existing.same(&fi) => {}
                    Some(_) => {
                        return Err(MirrorError::StorageCorrupt(format!(
                            "{}: path {path} produced by two suites with differing content",
                            self.id
                        )));
                    }
                    None => {
                        merged.insert(path, fi);
                    }
                }
            }
        }

        if !self.dry_run {
            self.new_storage.save()?;
            self.replace_link()?;
        }

        Ok(usage)
    }

    /// Atomically swings `rootDir/id` to point at `gen_dir/id`: create
    /// `rootDir/id.tmp`, fsync `rootDir`, `rename()` over `rootDir/id`,
    /// fsync `rootDir` again. Rename of a symlink is atomic at the
    /// directory-entry level on POSIX.
    fn replace_link(&self) -> Result<()> {
        let target = self.new_storage.root();
        let link = self.root_dir.join(&self.id);
        let tmp = self.root_dir.join(format!("{}.tmp", self.id));
        let _ = fs::remove_file(&tmp);

        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &tmp)?;
        #[cfg(not(unix))]
        return Err(MirrorError::Config("symlink swap requires unix".into()));

        fsync_dir(&self.root_dir)?;
        fs::rename(&tmp, &link)?;
        fsync_dir(&self.root_dir)?;
        info!("{}: published {}", self.id, target.display());
        Ok(())
    }

    /// The generation directory created for this run (used by the run
    /// coordinator's GC pass to recognize this run's own directory even
    /// if the symlink swap never happened, e.g. on error or dry-run).
    pub fn gen_dir(&self) -> &Path {
        &self.gen_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FiltersConfig;

    fn sample_config(url: &str) -> MirrorConfig {
        MirrorConfig {
            url: url.to_string(),
            suites: vec!["/".to_string()],
            sections: vec![],
            architectures: vec![],
            mirror_source: false,
            pgp_key_path: None,
            no_pgp_check: true,
            publish_to_staging: false,
            filters: FiltersConfig::default(),
            snapshot: None,
            tls: None,
        }
    }

    #[test]
    fn new_rejects_invalid_id() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let config = sample_config("http://example.org/debian/");
        let err = Mirror::new(dir.path(), "Bad ID", &config, None, 4, &cancel, true, false, "1");
        assert!(err.is_err());
    }

    #[test]
    fn new_creates_generation_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let config = sample_config("http://example.org/debian/");
        let mirror = Mirror::new(dir.path(), "debian", &config, None, 4, &cancel, true, false, "1").unwrap();
        assert!(dir.path().join(".debian.1").is_dir());
        assert_eq!(mirror.id(), "debian");
    }

    #[test]
    fn new_without_pgp_key_and_check_enabled_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut config = sample_config("http://example.org/debian/");
        config.no_pgp_check = false;
        assert!(Mirror::new(dir.path(), "debian", &config, None, 4, &cancel, false, false, "1").is_err());
    }
}
