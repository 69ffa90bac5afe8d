//! Repository pipeline (C5): per-suite Release/Index/Package phases.
//!
//! Each suite runs Phase R (Release discovery + signature verification),
//! Phase I (index selection via [`matching`] + fetch), then Phase P
//! (package extraction + [`filter`] + fetch), strictly in that order, the
//! way the teacher's `release_action`/`scan_action` stages a suite
//! through sequential `tokio::try_join!`/`spawn_blocking` steps rather
//! than interleaving them.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use log::{debug, info, warn};
use reqwest::Url;
use tempfile::NamedTempFile;
use tokio::task::JoinSet;

use crate::codec::{self, ReleaseFields};
use crate::error::{MirrorError, Result};
use crate::fetcher::{self, DlResult, Fetcher};
use crate::fileinfo::FileInfo;
use crate::filter::{self, FilterConfig};
use crate::matching::{self, MatchConfig};
use crate::pgp::{self, Verifier};
use crate::storage::Storage;

const RELEASE_CANDIDATES: [&str; 7] = [
    "Release",
    "Release.gpg",
    "Release.gz",
    "Release.bz2",
    "InRelease",
    "InRelease.gz",
    "InRelease.bz2",
];

const METADATA_PRIORITY: [&str; 6] = [
    "Release",
    "InRelease",
    "Release.gz",
    "Release.bz2",
    "InRelease.gz",
    "InRelease.bz2",
];

/// Sizes consumed (or, in dry-run mode, that *would* have been
/// consumed) by one suite's run, reported by the caller for `--dry-run`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsageStats {
    pub release_bytes: u64,
    pub index_bytes: u64,
    pub package_bytes: u64,
}

pub struct SuiteResult {
    pub release_fields: ReleaseFields,
    pub packages: HashMap<String, FileInfo>,
    pub usage: UsageStats,
}

/// The relative directory prefix under which a suite's release files
/// live: `dists/<suite>/` for non-flat, `<suite>` (unchanged, already
/// ending in `/`) for flat, and `""` for the flat root suite `/`.
fn suite_prefix(suite: &str) -> String {
    if suite == "/" {
        String::new()
    } else if suite.ends_with('/') {
        suite.to_string()
    } else {
        format!("dists/{suite}/")
    }
}

fn decompress_bytes(basename: &str, raw: Vec<u8>) -> Result<Vec<u8>> {
    use std::io::Read;
    let (_, compression) = codec::strip_compression(basename);
    match compression {
        crate::codec::Compression::None => Ok(raw),
        crate::codec::Compression::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(&raw[..])
                .read_to_end(&mut out)
                .map_err(|e| MirrorError::StorageCorrupt(format!("{basename}: gzip: {e}")))?;
            Ok(out)
        }
        crate::codec::Compression::Bzip2 => {
            let mut out = Vec::new();
            bzip2::read::BzDecoder::new(&raw[..])
                .read_to_end(&mut out)
                .map_err(|e| MirrorError::StorageCorrupt(format!("{basename}: bzip2: {e}")))?;
            Ok(out)
        }
        crate::codec::Compression::Xz => {
            let mut out = Vec::new();
            xz2::read::XzDecoder::new(&raw[..])
                .read_to_end(&mut out)
                .map_err(|e| MirrorError::StorageCorrupt(format!("{basename}: xz: {e}")))?;
            Ok(out)
        }
    }
}

/// Fetches all seven release-candidate names concurrently, tolerating
/// 404s and transport/HTTP failures on any individual candidate: Phase R
/// only needs whichever variants actually exist.
async fn fetch_release_candidates(
    fetcher: Arc<Fetcher>,
    storage: Arc<Storage>,
    base_url: Url,
    prefix: String,
) -> HashMap<String, (FileInfo, NamedTempFile)> {
    let mut joins: JoinSet<(String, DlResult)> = JoinSet::new();
    for name in RELEASE_CANDIDATES {
        let fetcher = fetcher.clone();
        let storage = storage.clone();
        let base_url = base_url.clone();
        let relpath = format!("{prefix}{name}");
        joins.spawn(async move {
            let dl = fetcher
                .download(&storage, &base_url, &relpath, None, false)
                .await;
            (name.to_string(), dl)
        });
    }

    let mut found = HashMap::new();
    while let Some(joined) = joins.join_next().await {
        let Ok((name, dl)) = joined else { continue };
        if dl.status == 200 {
            if let (Some(fi), Some(tmp)) = (dl.file_info, dl.temp_file) {
                found.insert(name, (fi, tmp));
            }
        } else if dl.status == 404 {
            debug!("release candidate {name} not present (404)");
        } else if let Some(e) = dl.error {
            warn!("release candidate {name}: {e}");
        }
    }
    found
}

/// Runs Phase R: downloads the release-candidate set, verifies
/// signatures per spec.md §4.4's three-way branch, and parses the first
/// successful candidate (by [`METADATA_PRIORITY`]) for its file list.
async fn phase_release(
    fetcher: Arc<Fetcher>,
    new_storage: Arc<Storage>,
    base_url: &Url,
    prefix: &str,
    verifier: Option<&Verifier>,
) -> Result<(codec::ExtractResult, u64)> {
    let downloads =
        fetch_release_candidates(fetcher, new_storage.clone(), base_url.clone(), prefix.to_string())
            .await;

    let metadata_name = METADATA_PRIORITY
        .iter()
        .find(|name| downloads.contains_key(**name))
        .copied()
        .ok_or_else(|| MirrorError::NotFound {
            path: format!("{prefix}Release"),
        })?;

    let has_inrelease = downloads.contains_key("InRelease");
    let has_release_and_gpg = downloads.contains_key("Release") && downloads.contains_key("Release.gpg");

    if let Some(verifier) = verifier {
        if has_inrelease {
            let (_, tmp) = downloads.get("InRelease").unwrap();
            let raw = std::fs::read(tmp.path())?;
            let decompressed = decompress_bytes("InRelease", raw)?;
            verifier.verify_clearsigned(&decompressed)?;
        } else if has_release_and_gpg {
            let (_, release_tmp) = downloads.get("Release").unwrap();
            let (_, gpg_tmp) = downloads.get("Release.gpg").unwrap();
            let release_bytes = std::fs::read(release_tmp.path())?;
            let gpg_bytes = std::fs::read(gpg_tmp.path())?;
            verifier.verify_detached(&gpg_bytes, &release_bytes)?;
        } else {
            return Err(MirrorError::Pgp(format!(
                "{prefix}: no InRelease or Release+Release.gpg pair available for verification"
            )));
        }
    }

    let mut release_bytes_total: u64 = 0;
    for (fi, tmp) in downloads.values() {
        new_storage.store_link(fi, tmp.path())?;
        release_bytes_total += fi.size;
    }

    let (_, metadata_tmp) = downloads.get(metadata_name).unwrap();
    let raw = std::fs::read(metadata_tmp.path())?;
    let decompressed = decompress_bytes(metadata_name, raw)?;
    let content = if metadata_name.starts_with("InRelease") {
        pgp::extract_clearsigned(&decompressed)?
    } else {
        decompressed
    };

    let (stem, _) = codec::strip_compression(metadata_name);
    let parse_path = format!("{prefix}{stem}");
    let result = codec::extract_file_info(&parse_path, Cursor::new(content))?;
    Ok((result, release_bytes_total))
}

/// spec.md §4.4 Phase R: by-hash is signalled by `Acquire-By-Hash: yes`,
/// but in practice is also inferred from the presence of `by-hash/` paths
/// among the emitted entries, since not every upstream sets the header
/// even when it publishes the layout.
fn detect_byhash(release: &codec::ExtractResult) -> bool {
    release
        .fields
        .get("Acquire-By-Hash")
        .map(|v| v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
        || release.files.iter().any(|fi| fi.path.contains("by-hash/"))
}

/// spec.md §4.4 Phase I: an index candidate must both match
/// `MatchingIndex` and have a supported final extension (after
/// compression stripping). A pdiff `.../Index` file matches the former
/// but isn't one of the three dialects this codec understands.
fn is_index_candidate(path: &str, cfg: &MatchConfig) -> bool {
    matching::matches(path, cfg) && codec::is_supported(path)
}

/// Runs one suite's three phases and returns its merged package set.
#[allow(clippy::too_many_arguments)]
pub async fn run_suite(
    fetcher: Arc<Fetcher>,
    current: Option<Arc<Storage>>,
    new_storage: Arc<Storage>,
    base_url: &Url,
    suite: &str,
    verifier: Option<&Verifier>,
    sections: &[String],
    architectures: &[String],
    mirror_source: bool,
    filter_cfg: &FilterConfig<'_>,
    dry_run: bool,
) -> Result<SuiteResult> {
    let flat = suite.ends_with('/');
    let prefix = suite_prefix(suite);

    let (release, release_bytes) =
        phase_release(fetcher.clone(), new_storage.clone(), base_url, &prefix, verifier).await?;

    let byhash = detect_byhash(&release);

    let match_cfg = MatchConfig {
        flat,
        sections,
        architectures,
        mirror_source,
    };
    let index_candidates: Vec<FileInfo> = release
        .files
        .iter()
        .filter(|fi| is_index_candidate(&fi.path, &match_cfg))
        .cloned()
        .collect();

    let indices = fetcher::batch(
        fetcher.clone(),
        current.clone(),
        new_storage.clone(),
        base_url,
        &index_candidates,
        true,
        byhash,
    )
    .await?;
    let index_bytes: u64 = indices.iter().map(|fi| fi.size).sum();

    let flat_prefix = if flat {
        suite.trim_end_matches('/').to_string()
    } else {
        String::new()
    };

    let mut packages: HashMap<String, FileInfo> = HashMap::new();
    for idx in &indices {
        if !codec::is_supported(&idx.path) || codec::is_meta(&idx.path) {
            continue;
        }
        let reader = new_storage.open(&idx.path)?;
        let extracted = codec::extract_file_info(&idx.path, reader)?;
        for mut fi in extracted.files {
            if !flat_prefix.is_empty() {
                fi.path = format!("{flat_prefix}/{}", fi.path);
            }
            match packages.get(&fi.path) {
                Some(existing) if existing.same(&fi) => {}
                Some(_existing) if byhash => {
                    debug!(
                        "{}: duplicate entry with differing content, keeping first seen (by-hash tolerance)",
                        fi.path
                    );
                }
                Some(_existing) => {
                    return Err(MirrorError::StorageCorrupt(format!(
                        "duplicate package path {} with differing content",
                        fi.path
                    )));
                }
                None => {
                    packages.insert(fi.path.clone(), fi);
                }
            }
        }
    }

    let filtered = filter::filter_packages(packages.into_values().collect(), filter_cfg);
    let package_bytes: u64 = filtered.iter().map(|fi| fi.size).sum();

    let usage = UsageStats {
        release_bytes,
        index_bytes,
        package_bytes,
    };

    let packages = if dry_run {
        info!(
            "{suite}: dry-run, {} packages would be fetched ({} bytes)",
            filtered.len(),
            package_bytes
        );
        filtered
            .into_iter()
            .map(|fi| (fi.path.clone(), fi))
            .collect()
    } else {
        let fetched = fetcher::batch(
            fetcher,
            current,
            new_storage,
            base_url,
            &filtered,
            false,
            byhash,
        )
        .await?;
        fetched.into_iter().map(|fi| (fi.path.clone(), fi)).collect()
    };

    Ok(SuiteResult {
        release_fields: release.fields,
        packages,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_prefix_root_flat_is_empty() {
        assert_eq!(suite_prefix("/"), "");
    }

    #[test]
    fn suite_prefix_flat_keeps_trailing_slash() {
        assert_eq!(suite_prefix("unstable/"), "unstable/");
    }

    #[test]
    fn suite_prefix_non_flat_uses_dists() {
        assert_eq!(suite_prefix("stable"), "dists/stable/");
    }

    #[test]
    fn detect_byhash_from_header_field() {
        let mut fields = HashMap::new();
        fields.insert("Acquire-By-Hash".to_string(), "yes".to_string());
        let release = codec::ExtractResult {
            files: vec![],
            fields,
        };
        assert!(detect_byhash(&release));
    }

    #[test]
    fn detect_byhash_falls_back_to_scanning_paths() {
        let release = codec::ExtractResult {
            files: vec![FileInfo::new(
                "dists/stable/main/binary-amd64/by-hash/SHA256/deadbeef",
                0,
                true,
            )
            .unwrap()],
            fields: HashMap::new(),
        };
        assert!(detect_byhash(&release));
    }

    #[test]
    fn detect_byhash_false_without_header_or_by_hash_paths() {
        let release = codec::ExtractResult {
            files: vec![FileInfo::new("dists/stable/main/binary-amd64/Packages", 0, true).unwrap()],
            fields: HashMap::new(),
        };
        assert!(!detect_byhash(&release));
    }

    #[test]
    fn is_index_candidate_excludes_unsupported_pdiff_index() {
        let sections = vec!["main".to_string()];
        let architectures = vec!["amd64".to_string()];
        let cfg = MatchConfig {
            flat: false,
            sections: &sections,
            architectures: &architectures,
            mirror_source: false,
        };
        assert!(matching::matches(
            "dists/stable/main/binary-amd64/Index",
            &cfg
        ));
        assert!(!is_index_candidate(
            "dists/stable/main/binary-amd64/Index",
            &cfg
        ));
        assert!(is_index_candidate(
            "dists/stable/main/binary-amd64/Packages.gz",
            &cfg
        ));
    }
}
