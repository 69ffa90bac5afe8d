//! Configuration (spec.md §6): TOML via `toml`/`serde`, exactly like
//! the teacher's `config.rs` (`parse_config`/`lint_config`), extended
//! to the global/per-mirror schema this crate needs and to `MIRRORCTL_*`
//! environment overrides.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::warn;
use serde::Deserialize;

fn default_max_conns() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    pub ca_cert_file: Option<String>,
    pub client_cert_file: Option<String>,
    pub client_key_file: Option<String>,
    #[serde(default)]
    pub cipher_suites: Vec<String>,
    pub server_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PruneConfig {
    pub keep_last: Option<usize>,
    pub keep_within: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SnapshotConfig {
    pub path: Option<String>,
    pub default_name_format: Option<String>,
    pub prune: Option<PruneConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FiltersConfig {
    #[serde(default)]
    pub keep_versions: usize,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    pub url: String,
    pub suites: Vec<String>,
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub mirror_source: bool,
    pub pgp_key_path: Option<String>,
    #[serde(default)]
    pub no_pgp_check: bool,
    #[serde(default)]
    pub publish_to_staging: bool,
    #[serde(default)]
    pub filters: FiltersConfig,
    pub snapshot: Option<SnapshotConfig>,
    pub tls: Option<TlsConfig>,
}

impl MirrorConfig {
    /// A suite is "flat" when it ends in `/`; §6 requires either all
    /// suites or none to be flat.
    pub fn is_flat(&self) -> bool {
        self.suites.first().map(|s| s.ends_with('/')).unwrap_or(false)
    }

    pub(crate) fn validate(&self, id: &str) -> Result<()> {
        if self.suites.is_empty() {
            bail!("mirror {id}: suites must be nonempty");
        }
        let flat = self.is_flat();
        if self.suites.iter().any(|s| s.ends_with('/') != flat) {
            bail!("mirror {id}: suites must be either all flat (end with '/') or all non-flat");
        }
        if !flat {
            if self.sections.is_empty() {
                bail!("mirror {id}: sections is required for non-flat suites");
            }
            if self.architectures.is_empty() {
                bail!("mirror {id}: architectures is required for non-flat suites");
            }
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            bail!("mirror {id}: url must be http or https");
        }
        if let Some(key) = &self.pgp_key_path {
            if !Path::new(key).is_absolute() {
                bail!("mirror {id}: pgp_key_path must be absolute");
            }
        }
        if self.pgp_key_path.is_none() && !self.no_pgp_check {
            bail!("mirror {id}: no pgp_key_path configured; set no_pgp_check if that's intended");
        }
        Ok(())
    }

    /// `url` normalized to end with a trailing `/`, per §6.
    pub fn normalized_url(&self) -> String {
        if self.url.ends_with('/') {
            self.url.clone()
        } else {
            format!("{}/", self.url)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub dir: String,
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    #[serde(default)]
    pub log: LogConfig,
    pub tls: Option<TlsConfig>,
    pub snapshot: Option<SnapshotConfig>,
    #[serde(default)]
    pub mirrors: HashMap<String, MirrorConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !Path::new(&self.dir).is_absolute() {
            bail!("dir must be an absolute path");
        }
        if self.max_conns == 0 {
            bail!("max_conns must be positive");
        }
        for (id, mirror) in &self.mirrors {
            crate::path_safety::validate_identifier(id).map_err(|e| anyhow::anyhow!("{e}"))?;
            mirror.validate(id)?;
        }
        Ok(())
    }
}

/// Warns (but does not fail) on configuration combinations that are
/// legal but probably not what the operator meant, the way the
/// teacher's `lint_config` flags deprecated options.
pub fn lint_config(config: &Config) {
    for (id, mirror) in &config.mirrors {
        if mirror.no_pgp_check {
            warn!("mirror {id}: PGP verification is disabled (no_pgp_check=true)");
        }
        if mirror.publish_to_staging && config.snapshot.is_none() && mirror.snapshot.is_none() {
            warn!("mirror {id}: publish_to_staging is set but no snapshot configuration is present");
        }
        if mirror
            .tls
            .as_ref()
            .map(|t| t.insecure_skip_verify)
            .unwrap_or(false)
        {
            warn!("mirror {id}: TLS certificate verification is disabled (insecure_skip_verify=true)");
        }
    }
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let mut f = File::open(path.as_ref())
        .with_context(|| format!("opening config file {}", path.as_ref().display()))?;
    let mut content = String::new();
    content.reserve(1024);
    f.read_to_string(&mut content)?;

    let mut config: Config = toml::from_str(&content).context("parsing config TOML")?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Applies `MIRRORCTL_*` environment overrides for the handful of
/// global scalar fields that make sense to flip per-invocation
/// (connection limit, log level/format, root directory). Per-mirror
/// fields are configured only through the TOML file.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("MIRRORCTL_DIR") {
        config.dir = v;
    }
    if let Ok(v) = std::env::var("MIRRORCTL_MAX_CONNS") {
        match v.parse() {
            Ok(n) => config.max_conns = n,
            Err(_) => warn!("MIRRORCTL_MAX_CONNS={v:?} is not a valid integer, ignoring"),
        }
    }
    if let Ok(v) = std::env::var("MIRRORCTL_LOG_LEVEL") {
        config.log.level = Some(v);
    }
    if let Ok(v) = std::env::var("MIRRORCTL_LOG_FORMAT") {
        config.log.format = Some(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mirror() -> MirrorConfig {
        MirrorConfig {
            url: "http://deb.example.org/debian".into(),
            suites: vec!["stable".into()],
            sections: vec!["main".into()],
            architectures: vec!["amd64".into()],
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
    fn non_flat_requires_sections_and_architectures() {
        let mut mirror = sample_mirror();
        mirror.sections.clear();
        assert!(mirror.validate("test").is_err());
    }

    #[test]
    fn mixed_flat_and_non_flat_suites_rejected() {
        let mut mirror = sample_mirror();
        mirror.suites = vec!["stable".into(), "unstable/".into()];
        assert!(mirror.validate("test").is_err());
    }

    #[test]
    fn no_pgp_key_requires_explicit_opt_out() {
        let mut mirror = sample_mirror();
        mirror.no_pgp_check = false;
        assert!(mirror.validate("test").is_err());
    }

    #[test]
    fn normalized_url_adds_trailing_slash() {
        let mirror = sample_mirror();
        assert_eq!(mirror.normalized_url(), "http://deb.example.org/debian/");
    }

    #[test]
    fn config_requires_absolute_dir() {
        let config = Config {
            dir: "relative/path".into(),
            max_conns: 10,
            log: LogConfig::default(),
            tls: None,
            snapshot: None,
            mirrors: HashMap::new(),
        };
        assert!(config.validate().is_err());
    }
}
