//! `Release`/`InRelease` parsing.
//!
//! Reads the top `Key: value` header, then accumulates hash-section
//! lines (`MD5Sum`, `SHA1`, `SHA256`, `SHA512`). Each indented line
//! yields one [`FileInfo`] whose path is `<dir-of-release-file>/<relpath>`.
//! Repeated sightings of the same relative path across sections merge
//! into a single `FileInfo`; a size mismatch across sections is fatal.

use std::collections::HashMap;

use crate::error::{MirrorError, Result};
use crate::fileinfo::{FileInfo, HashAlgo};
use crate::path_safety::clean_relative;

use super::ExtractResult;

pub type ReleaseFields = HashMap<String, String>;

const HASH_SECTIONS: &[(&str, HashAlgo)] = &[
    ("MD5Sum", HashAlgo::Md5),
    ("SHA1", HashAlgo::Sha1),
    ("SHA256", HashAlgo::Sha256),
    ("SHA512", HashAlgo::Sha512),
];

/// The directory containing `release_path`, or `""` for a root-level file.
fn release_dir(release_path: &str) -> &str {
    match release_path.rfind('/') {
        Some(idx) => &release_path[..idx],
        None => "",
    }
}

fn parse_hash_line(line: &str, algo: HashAlgo, dir: &str) -> Result<Option<FileInfo>> {
    let mut parts = line.split_whitespace();
    let (Some(hex_digest), Some(size), Some(relpath)) = (parts.next(), parts.next(), parts.next())
    else {
        return Ok(None);
    };
    let relpath = clean_relative(relpath)?;
    if relpath.is_empty() {
        return Ok(None);
    }
    let size: u64 = size
        .parse()
        .map_err(|_| MirrorError::StorageCorrupt(format!("bad size in Release hash line: {line}")))?;
    let digest = hex::decode(hex_digest)
        .map_err(|_| MirrorError::StorageCorrupt(format!("bad hex digest in Release: {line}")))?;
    if digest.len() != algo.digest_len() {
        return Err(MirrorError::StorageCorrupt(format!(
            "{algo} digest has wrong length in Release: {line}"
        )));
    }

    let path = if dir.is_empty() {
        relpath
    } else {
        format!("{dir}/{relpath}")
    };
    let mut info = FileInfo::new(&path, size, true)?;
    match algo {
        HashAlgo::Md5 => info = info.with_md5(digest.try_into().unwrap()),
        HashAlgo::Sha1 => info = info.with_sha1(digest.try_into().unwrap()),
        HashAlgo::Sha256 => info = info.with_sha256(digest.try_into().unwrap()),
        HashAlgo::Sha512 => info = info.with_sha512(digest.try_into().unwrap()),
    }
    Ok(Some(info))
}

pub(super) fn parse(text: &str, release_path: &str) -> Result<ExtractResult> {
    let paragraphs = crate::parser::parse_paragraphs(text);
    let paragraph = paragraphs
        .into_iter()
        .next()
        .ok_or_else(|| MirrorError::StorageCorrupt(format!("{release_path}: empty Release file")))?;

    let dir = release_dir(release_path);
    let mut fields: ReleaseFields = HashMap::new();
    let mut by_path: HashMap<String, FileInfo> = HashMap::new();

    for (key, field) in &paragraph {
        if let Some(&(_, algo)) = HASH_SECTIONS.iter().find(|(name, _)| name == key) {
            for line in field.lines() {
                if let Some(info) = parse_hash_line(line, algo, dir)? {
                    match by_path.get_mut(&info.path) {
                        Some(existing) => existing.merge(&info)?,
                        None => {
                            by_path.insert(info.path.clone(), info);
                        }
                    }
                }
            }
        } else {
            fields.insert(key.clone(), field.value.clone());
        }
    }

    let mut files: Vec<FileInfo> = by_path.into_values().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(ExtractResult { files, fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        "Origin: Debian\nLabel: Debian\nSuite: stable\nAcquire-By-Hash: yes\nMD5Sum:\n d41d8cd98f00b204e9800998ecf8427e 0 main/binary-amd64/Packages\nSHA256:\n e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 0 main/binary-amd64/Packages\n"
    }

    #[test]
    fn merges_same_path_across_sections() {
        let result = parse(sample(), "dists/stable/Release").unwrap();
        assert_eq!(result.files.len(), 1);
        let info = &result.files[0];
        assert_eq!(info.path, "dists/stable/main/binary-amd64/Packages");
        assert!(info.md5sum.is_some());
        assert!(info.sha256sum.is_some());
    }

    #[test]
    fn captures_header_fields() {
        let result = parse(sample(), "dists/stable/Release").unwrap();
        assert_eq!(result.fields.get("Acquire-By-Hash").map(String::as_str), Some("yes"));
        assert_eq!(result.fields.get("Suite").map(String::as_str), Some("stable"));
    }

    #[test]
    fn root_level_release_has_no_dir_prefix() {
        let text = "Origin: x\nMD5Sum:\n d41d8cd98f00b204e9800998ecf8427e 0 Packages\n";
        let result = parse(text, "Release").unwrap();
        assert_eq!(result.files[0].path, "Packages");
    }

    #[test]
    fn size_mismatch_across_sections_is_fatal() {
        let text = "Origin: x\nMD5Sum:\n d41d8cd98f00b204e9800998ecf8427e 10 main/Packages\nSHA256:\n e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 20 main/Packages\n";
        assert!(parse(text, "dists/stable/Release").is_err());
    }

    #[test]
    fn rejects_traversal_in_relpath() {
        let text = "Origin: x\nMD5Sum:\n d41d8cd98f00b204e9800998ecf8427e 0 ../../etc/passwd\n";
        let err = parse(text, "dists/stable/Release").unwrap_err();
        assert!(format!("{err:?}").to_lowercase().contains("traversal"));
    }
}
