//! `MatchingIndex` (C5): decides which release-enumerated paths are
//! index files worth fetching, given a mirror's configured sections,
//! architectures, and source-mirroring flag.
//!
//! Per-section `Release` files are deliberately excluded (only the
//! suite-root `Release` matches) — the safer of the two behaviors seen
//! across upstream variants; see DESIGN.md for the recorded decision.

use crate::codec::{basename, strip_compression};

/// The subset of a mirror's configuration that `matches` needs to
/// decide whether a release-enumerated path should be treated as an
/// index file.
pub struct MatchConfig<'a> {
    pub flat: bool,
    pub sections: &'a [String],
    pub architectures: &'a [String],
    pub mirror_source: bool,
}

/// Strips a trailing compression suffix from `path`'s basename only,
/// keeping the directory intact, e.g. `a/b/Packages.xz` -> `a/b/Packages`.
fn stripped_path(path: &str) -> String {
    let base = basename(path);
    let (stem, _) = strip_compression(base);
    let dir_len = path.len() - base.len();
    format!("{}{}", &path[..dir_len], stem)
}

fn dir_of(path: &str) -> &str {
    let base = basename(path);
    &path[..path.len() - base.len()]
}

/// True iff `path` (a file enumerated by the suite's Release document)
/// is an index file this configuration should fetch in Phase I.
pub fn matches(path: &str, cfg: &MatchConfig) -> bool {
    let stripped = stripped_path(path);
    let stem = basename(&stripped);

    if stem == "Index" {
        return true;
    }
    if stem == "Release" {
        let dir = dir_of(&stripped);
        return !dir.contains("binary-") && !dir.contains("source");
    }

    if cfg.flat {
        return match stem {
            "Packages" => true,
            "Sources" => cfg.mirror_source,
            _ => false,
        };
    }

    for section in cfg.sections {
        for arch in std::iter::once("all").chain(cfg.architectures.iter().map(String::as_str)) {
            if stripped.ends_with(&format!("{section}/binary-{arch}/Packages")) {
                return true;
            }
        }
        if cfg.mirror_source && stripped.ends_with(&format!("{section}/source/Sources")) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg<'a>(sections: &'a [String], architectures: &'a [String], mirror_source: bool) -> MatchConfig<'a> {
        MatchConfig {
            flat: false,
            sections,
            architectures,
            mirror_source,
        }
    }

    #[test]
    fn index_always_matches() {
        let sections = vec![];
        let arches = vec![];
        assert!(matches("dists/stable/main/binary-amd64/Index", &cfg(&sections, &arches, false)));
    }

    #[test]
    fn suite_root_release_matches_but_section_release_does_not() {
        let sections = vec!["main".to_string()];
        let arches = vec!["amd64".to_string()];
        let c = cfg(&sections, &arches, false);
        assert!(matches("dists/stable/Release", &c));
        assert!(!matches("dists/stable/main/binary-amd64/Release", &c));
        assert!(!matches("dists/stable/main/source/Release", &c));
    }

    #[test]
    fn non_flat_matches_configured_section_and_arch_plus_all() {
        let sections = vec!["main".to_string()];
        let arches = vec!["amd64".to_string()];
        let c = cfg(&sections, &arches, false);
        assert!(matches("dists/stable/main/binary-amd64/Packages.xz", &c));
        assert!(matches("dists/stable/main/binary-all/Packages", &c));
        assert!(!matches("dists/stable/contrib/binary-amd64/Packages", &c));
        assert!(!matches("dists/stable/main/source/Sources", &c));
    }

    #[test]
    fn non_flat_source_requires_mirror_source() {
        let sections = vec!["main".to_string()];
        let arches = vec!["amd64".to_string()];
        assert!(matches(
            "dists/stable/main/source/Sources",
            &cfg(&sections, &arches, true)
        ));
        assert!(!matches(
            "dists/stable/main/source/Sources",
            &cfg(&sections, &arches, false)
        ));
    }

    #[test]
    fn flat_only_accepts_packages_and_sources() {
        let sections = vec![];
        let arches = vec![];
        let c = MatchConfig {
            flat: true,
            sections: &sections,
            architectures: &arches,
            mirror_source: true,
        };
        assert!(matches("pool/Packages", &c));
        assert!(matches("pool/Sources.gz", &c));
        assert!(!matches("pool/Contents-amd64.gz", &c));
    }
}
