//! Package filtering (C5, Phase P): basename parsing, shell-glob
//! exclude patterns, and Debian version comparison for `KeepVersions`
//! truncation.
//!
//! The version-comparison algorithm below is a from-scratch
//! reimplementation of the `dpkg`/`deb-version(5)` ordering rules
//! (epoch, then upstream-version, then debian-revision, each compared
//! by alternating non-digit/digit runs with `~` sorting lowest of all).

use std::cmp::Ordering;
use std::collections::HashMap;

use glob::Pattern;
use log::debug;

use crate::fileinfo::FileInfo;

/// The `name_version_arch` decomposition of a `.deb` basename.
struct DebName {
    name: String,
    version: String,
}

/// Splits `basename` (without directory) as `name_version_arch.deb` by
/// `_`. Requires at least three underscore-separated parts; anything
/// else "is not considered a package" per the design and is left for
/// the caller to pass through unfiltered.
fn parse_deb_name(path: &str) -> Option<DebName> {
    let base = path.rsplit('/').next().unwrap_or(path);
    let base = base.strip_suffix(".deb")?;
    let parts: Vec<&str> = base.split('_').collect();
    if parts.len() < 3 {
        return None;
    }
    Some(DebName {
        name: parts[0].to_string(),
        version: parts[1].to_string(),
    })
}

fn order(c: char) -> i32 {
    if c == '~' {
        -1
    } else if c.is_ascii_digit() {
        0
    } else if c.is_ascii_alphabetic() {
        c as i32
    } else {
        c as i32 + 256
    }
}

/// Compares two non-digit/digit-alternating fragments (an
/// upstream-version or debian-revision) per `deb-version(5)`.
fn verrevcmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    loop {
        if i >= a.len() && j >= b.len() {
            return Ordering::Equal;
        }
        loop {
            let ca = (i < a.len() && !(a[i] as char).is_ascii_digit()).then(|| a[i] as char);
            let cb = (j < b.len() && !(b[j] as char).is_ascii_digit()).then(|| b[j] as char);
            if ca.is_none() && cb.is_none() {
                break;
            }
            let (vc1, vc2) = (ca.map(order).unwrap_or(0), cb.map(order).unwrap_or(0));
            if vc1 != vc2 {
                return vc1.cmp(&vc2);
            }
            if ca.is_some() {
                i += 1;
            }
            if cb.is_some() {
                j += 1;
            }
        }

        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }

        let mut first_diff: i32 = 0;
        while i < a.len()
            && (a[i] as char).is_ascii_digit()
            && j < b.len()
            && (b[j] as char).is_ascii_digit()
        {
            if first_diff == 0 {
                first_diff = a[i] as i32 - b[j] as i32;
            }
            i += 1;
            j += 1;
        }
        if i < a.len() && (a[i] as char).is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && (b[j] as char).is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != 0 {
            return first_diff.cmp(&0);
        }
    }
}

fn split_version(v: &str) -> (u64, &str, &str) {
    let (epoch, rest) = match v.find(':') {
        Some(idx) => (v[..idx].parse().unwrap_or(0), &v[idx + 1..]),
        None => (0, v),
    };
    match rest.rfind('-') {
        Some(idx) => (epoch, &rest[..idx], &rest[idx + 1..]),
        None => (epoch, rest, "0"),
    }
}

/// Orders two Debian version strings, strongest (newest) last.
pub fn compare_version(a: &str, b: &str) -> Ordering {
    let (ea, ua, ra) = split_version(a);
    let (eb, ub, rb) = split_version(b);
    ea.cmp(&eb)
        .then_with(|| verrevcmp(ua, ub))
        .then_with(|| verrevcmp(ra, rb))
}

/// Package-filter configuration: glob patterns excluding whole packages
/// by `name`, `version`, or `name_version`, plus a per-name version cap.
pub struct FilterConfig<'a> {
    pub exclude_patterns: &'a [String],
    pub keep_versions: usize,
}

fn excluded(name: &str, version: &str, patterns: &[String]) -> bool {
    let name_version = format!("{name}_{version}");
    patterns.iter().any(|pat| {
        Pattern::new(pat)
            .map(|p| p.matches(name) || p.matches(version) || p.matches(&name_version))
            .unwrap_or(false)
    })
}

/// Applies exclude patterns and per-package `KeepVersions` truncation.
/// Files whose basename doesn't parse as `name_version_arch.deb` bypass
/// filtering entirely and are always kept.
pub fn filter_packages(files: Vec<FileInfo>, cfg: &FilterConfig) -> Vec<FileInfo> {
    let mut passthrough = Vec::new();
    let mut groups: HashMap<String, Vec<(String, FileInfo)>> = HashMap::new();

    for fi in files {
        match parse_deb_name(&fi.path) {
            None => passthrough.push(fi),
            Some(deb) => {
                if excluded(&deb.name, &deb.version, cfg.exclude_patterns) {
                    debug!("filter: excluding {}", fi.path);
                    continue;
                }
                groups.entry(deb.name).or_default().push((deb.version, fi));
            }
        }
    }

    let mut kept = passthrough;
    for (_, mut versions) in groups {
        versions.sort_by(|(va, _), (vb, _)| compare_version(vb, va));
        let limit = if cfg.keep_versions == 0 {
            versions.len()
        } else {
            cfg.keep_versions.min(versions.len())
        };
        kept.extend(versions.into_iter().take(limit).map(|(_, fi)| fi));
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fi(path: &str) -> FileInfo {
        FileInfo::new(path, 1, true).unwrap().with_sha256([1u8; 32])
    }

    #[test]
    fn version_compare_basic_numeric() {
        assert_eq!(compare_version("8.0", "8.1"), Ordering::Less);
        assert_eq!(compare_version("8.2", "8.10"), Ordering::Less);
        assert_eq!(compare_version("1.0-1", "1.0-2"), Ordering::Less);
    }

    #[test]
    fn version_compare_tilde_sorts_lowest() {
        assert_eq!(compare_version("1.0~beta1", "1.0"), Ordering::Less);
    }

    #[test]
    fn version_compare_epoch_dominates() {
        assert_eq!(compare_version("1:1.0", "2.0"), Ordering::Greater);
    }

    #[test]
    fn vim_nano_scenario_from_design_notes() {
        let files = vec![
            fi("pool/vim_8.0_amd64.deb"),
            fi("pool/vim_8.1_amd64.deb"),
            fi("pool/vim_8.2_amd64.deb"),
            fi("pool/nano_4.0_amd64.deb"),
            fi("pool/nano_5.0_amd64.deb"),
            fi("pool/nano_6.0_amd64.deb"),
        ];
        let patterns = vec!["vim*".to_string()];
        let cfg = FilterConfig {
            exclude_patterns: &patterns,
            keep_versions: 2,
        };
        let mut kept: Vec<String> = filter_packages(files, &cfg)
            .into_iter()
            .map(|fi| fi.path)
            .collect();
        kept.sort();
        assert_eq!(
            kept,
            vec![
                "pool/nano_5.0_amd64.deb".to_string(),
                "pool/nano_6.0_amd64.deb".to_string(),
            ]
        );
    }

    #[test]
    fn non_package_paths_pass_through_unfiltered() {
        let files = vec![fi("pool/README"), fi("pool/weird-name")];
        let cfg = FilterConfig {
            exclude_patterns: &[],
            keep_versions: 1,
        };
        assert_eq!(filter_packages(files, &cfg).len(), 2);
    }
}
