//! Run coordinator (C7): holds `rootDir/.lock` for the run, fans the
//! selected mirrors out in parallel with first-error cancellation,
//! publishes configured staging snapshots, then garbage-collects
//! orphaned generation directories.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use log::{debug, error, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result as MirrorResult;
use crate::lock::RunLock;
use crate::mirror::Mirror;
use crate::pipeline::UsageStats;
use crate::snapshot::SnapshotManager;

/// Per-mirror outcome of one `run()` invocation.
pub struct RunOutcome {
    pub mirror_results: HashMap<String, std::result::Result<UsageStats, String>>,
}

pub async fn run(
    config: &Config,
    mirror_ids: &[String],
    no_pgp_check: bool,
    dry_run: bool,
    force: bool,
) -> anyhow::Result<RunOutcome> {
    let root_dir = Path::new(&config.dir);
    let _lock = RunLock::acquire(root_dir)?;

    let selected: Vec<String> = if mirror_ids.is_empty() {
        config.mirrors.keys().cloned().collect()
    } else {
        mirror_ids.to_vec()
    };

    let timestamp = time::OffsetDateTime::now_utc().unix_timestamp().to_string();
    let parent_cancel = CancellationToken::new();
    let mut joins: JoinSet<(String, MirrorResult<UsageStats>)> = JoinSet::new();

    for id in &selected {
        let Some(mirror_config) = config.mirrors.get(id) else {
            warn!("requested mirror {id} is not configured, skipping");
            continue;
        };
        let mirror = match Mirror::new(
            root_dir,
            id,
            mirror_config,
            config.tls.as_ref(),
            config.max_conns,
            &parent_cancel,
            no_pgp_check,
            dry_run,
            &timestamp,
        ) {
            Ok(m) => m,
            Err(e) => {
                error!("{id}: failed to initialize: {e}");
                continue;
            }
        };

        let id_owned = id.clone();
        joins.spawn(async move {
            let result = mirror.update().await;
            (id_owned, result)
        });
    }

    let mut results: HashMap<String, std::result::Result<UsageStats, String>> = HashMap::new();
    let mut first_error: Option<String> = None;

    while let Some(joined) = joins.join_next().await {
        let Ok((id, result)) = joined else { continue };
        match result {
            Ok(usage) => {
                info!(
                    "{id}: update complete ({} release bytes, {} index bytes, {} package bytes)",
                    usage.release_bytes, usage.index_bytes, usage.package_bytes
                );
                results.insert(id, Ok(usage));
            }
            Err(e) => {
                error!("{id}: update failed: {e}");
                if first_error.is_none() {
                    first_error = Some(format!("{id}: {e}"));
                    parent_cancel.cancel();
                }
                results.insert(id, Err(e.to_string()));
            }
        }
    }

    if !dry_run {
        publish_staging_snapshots(config, root_dir, &selected, &results, force);
    }

    if let Err(e) = run_gc(root_dir) {
        warn!("gc: {e}");
    }

    match first_error {
        Some(e) => Err(anyhow::anyhow!(e)),
        None => Ok(RunOutcome {
            mirror_results: results,
        }),
    }
}

fn publish_staging_snapshots(
    config: &Config,
    root_dir: &Path,
    selected: &[String],
    results: &HashMap<String, std::result::Result<UsageStats, String>>,
    force: bool,
) {
    let Some(global_snapshot) = &config.snapshot else {
        return;
    };
    let snap_dir = global_snapshot
        .path
        .clone()
        .unwrap_or_else(|| format!("{}/snapshots", config.dir));
    let mgr = SnapshotManager::new(root_dir, Path::new(&snap_dir));

    for id in selected {
        let Some(mirror_config) = config.mirrors.get(id) else {
            continue;
        };
        if !mirror_config.publish_to_staging {
            continue;
        }
        if !matches!(results.get(id), Some(Ok(_))) {
            continue;
        }
        let name_format = mirror_config
            .snapshot
            .as_ref()
            .and_then(|s| s.default_name_format.clone())
            .or_else(|| global_snapshot.default_name_format.clone())
            .unwrap_or_else(|| "[year][month][day]T[hour][minute][second]Z".to_string());

        match mgr.create_snapshot(id, None, force, &name_format) {
            Ok(name) => {
                if let Err(e) = mgr.publish_snapshot_to_staging(id, &name) {
                    warn!("{id}: failed to publish snapshot {name} to staging: {e}");
                } else {
                    info!("{id}: staged snapshot {name}");
                }
            }
            Err(e) => warn!("{id}: failed to create snapshot for staging: {e}"),
        }
    }
}

/// Marks every live symlink (`<M>` and `<M>-staging`) and the generation
/// directory each resolves into, then deletes every other entry under
/// `rootDir` except `.lock`.
fn run_gc(root_dir: &Path) -> MirrorResult<()> {
    let mut live_names: HashSet<String> = HashSet::new();
    let mut live_generations: HashSet<String> = HashSet::new();

    for entry in fs::read_dir(root_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".lock" {
            continue;
        }
        let path = entry.path();
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if !meta.file_type().is_symlink() {
            continue;
        }
        live_names.insert(name);
        if let Ok(target) = fs::read_link(&path) {
            let resolved = if target.is_absolute() {
                target
            } else {
                root_dir.join(&target)
            };
            if let Some(generation) = resolved.parent().and_then(|p| p.file_name()) {
                live_generations.insert(generation.to_string_lossy().into_owned());
            }
        }
    }

    for entry in fs::read_dir(root_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".lock" || live_names.contains(&name) || live_generations.contains(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            debug!("gc: removing orphaned directory {}", path.display());
            fs::remove_dir_all(&path)?;
        } else {
            debug!("gc: removing orphaned entry {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_keeps_lock_and_live_generation_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join(".lock"), b"").unwrap();
        fs::create_dir_all(root.join(".debian.100/debian")).unwrap();
        fs::create_dir_all(root.join(".debian.50/debian")).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.join(".debian.100/debian"), root.join("debian")).unwrap();

        run_gc(root).unwrap();

        assert!(root.join(".lock").exists());
        assert!(root.join(".debian.100").exists());
        assert!(!root.join(".debian.50").exists());
    }
}
